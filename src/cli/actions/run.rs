use crate::cli::{
    actions::{Action, hash, issue, serve},
    telemetry,
};
use anyhow::Result;

/// Execute the provided action.
// This is the single dispatch point for all CLI actions.
/// # Errors
/// Returns an error if the action fails.
pub async fn execute(action: Action) -> Result<()> {
    let result = match action {
        Action::Serve(args) => serve::execute(args).await,
        Action::Issue(args) => issue::execute(args),
        Action::Hash(args) => hash::execute(args).await,
    };

    telemetry::shutdown_tracer();

    result
}
