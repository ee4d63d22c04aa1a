use clap::{Arg, Command};

pub const ARG_ENCRYPTION_KEY: &str = "encryption-key";
pub const ARG_SECRET: &str = "secret";

pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ENCRYPTION_KEY)
                .long(ARG_ENCRYPTION_KEY)
                .help("Token encryption key (at least 15 characters)")
                .env("TOKENGATE_ENCRYPTION_KEY")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_SECRET)
                .long(ARG_SECRET)
                .help("Token signing secret")
                .env("TOKENGATE_SECRET")
                .hide_env_values(true)
                .required(true),
        )
}
