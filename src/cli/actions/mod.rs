pub mod hash;
pub mod issue;
pub mod serve;

// Internal "interpreter" for `Action`.
// We keep the match in a separate module so `mod.rs` stays small as more actions are added.
mod run;

#[derive(Debug)]
pub enum Action {
    Serve(serve::Args),
    Issue(issue::Args),
    Hash(hash::Args),
}

impl Action {
    /// Execute the action.
    /// # Errors
    /// Returns an error if the action fails.
    pub async fn execute(self) -> anyhow::Result<()> {
        run::execute(self).await
    }
}
