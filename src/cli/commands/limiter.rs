use clap::{Arg, ArgAction, Command};

pub const ARG_DISABLE: &str = "no-rate-limit";
pub const ARG_ENVIRONMENT: &str = "limiter-env";
pub const ARG_STORE_HOST: &str = "store-host";
pub const ARG_STORE_PORT: &str = "store-port";
pub const ARG_FREE_RETRIES: &str = "free-retries";
pub const ARG_MIN_WAIT: &str = "min-wait";
pub const ARG_MAX_WAIT: &str = "max-wait";
pub const ARG_LIFETIME: &str = "lifetime";
pub const ARG_REFRESH: &str = "refresh-on-request";

pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_DISABLE)
                .long(ARG_DISABLE)
                .help("Serve without the rate limiter")
                .env("TOKENGATE_NO_RATE_LIMIT")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_ENVIRONMENT)
                .long(ARG_ENVIRONMENT)
                .help("Where attempt records live: development (memory) or production (redis)")
                .env("TOKENGATE_LIMITER_ENV")
                .default_value("development"),
        )
        .arg(
            Arg::new(ARG_STORE_HOST)
                .long(ARG_STORE_HOST)
                .help("Redis host (required in production)")
                .env("TOKENGATE_STORE_HOST"),
        )
        .arg(
            Arg::new(ARG_STORE_PORT)
                .long(ARG_STORE_PORT)
                .help("Redis port (required in production)")
                .env("TOKENGATE_STORE_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new(ARG_FREE_RETRIES)
                .long(ARG_FREE_RETRIES)
                .help("Attempts allowed before delays apply")
                .env("TOKENGATE_FREE_RETRIES")
                .default_value("1000")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_MIN_WAIT)
                .long(ARG_MIN_WAIT)
                .help("Shortest delay once free retries are used, in milliseconds")
                .env("TOKENGATE_MIN_WAIT")
                .default_value("2000")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_MAX_WAIT)
                .long(ARG_MAX_WAIT)
                .help("Longest delay, in milliseconds")
                .env("TOKENGATE_MAX_WAIT")
                .default_value("10000")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_LIFETIME)
                .long(ARG_LIFETIME)
                .help("Attempt record lifetime, in seconds")
                .env("TOKENGATE_LIFETIME")
                .default_value("86400")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_REFRESH)
                .long(ARG_REFRESH)
                .help("Restart the record lifetime on every admitted attempt")
                .env("TOKENGATE_REFRESH_ON_REQUEST")
                .action(ArgAction::SetTrue),
        )
}
