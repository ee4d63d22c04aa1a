pub mod gate;
pub mod limiter;
pub mod logging;

use clap::{
    Arg, ColorChoice, Command,
    builder::styling::{AnsiColor, Effects, Styles},
};

pub const CMD_SERVE: &str = "serve";
pub const CMD_ISSUE: &str = "issue";
pub const CMD_HASH: &str = "hash";

pub const ARG_NAME: &str = "name";
pub const ARG_PORT: &str = "port";
pub const ARG_ENTITIES: &str = "entities";
pub const ARG_CLAIMS: &str = "claims";
pub const ARG_TTL: &str = "ttl";
pub const ARG_TEXT: &str = "text";
pub const ARG_COST: &str = "cost";

fn serve() -> Command {
    let command = Command::new(CMD_SERVE)
        .about("Serve a gated demo API backed by a static entity file")
        .arg(
            Arg::new(ARG_NAME)
                .long(ARG_NAME)
                .help("Application name reported by /health")
                .env("TOKENGATE_NAME")
                .default_value(env!("CARGO_PKG_NAME")),
        )
        .arg(
            Arg::new(ARG_PORT)
                .short('p')
                .long(ARG_PORT)
                .help("Port to listen on; the next free port is used when taken")
                .default_value("8080")
                .env("TOKENGATE_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new(ARG_ENTITIES)
                .short('e')
                .long(ARG_ENTITIES)
                .help("JSON file mapping each allowed entity type to its records")
                .long_help(
                    "JSON file mapping each allowed entity type to an array of records, e.g. {\"user\": [{\"_id\": \"u1\", \"name\": \"A\"}]}. Only the listed types can pass the gate.",
                )
                .env("TOKENGATE_ENTITIES")
                .required(true),
        );

    let command = gate::with_args(command);
    limiter::with_args(command)
}

fn issue() -> Command {
    let command = Command::new(CMD_ISSUE)
        .about("Issue a token for the given claims")
        .arg(
            Arg::new(ARG_CLAIMS)
                .help("Claims as JSON, e.g. '{\"id\": \"u1\", \"typeOf\": \"user\"}'")
                .required(true),
        )
        .arg(
            Arg::new(ARG_TTL)
                .long(ARG_TTL)
                .help("Token lifetime in seconds (embeds an exp claim)")
                .env("TOKENGATE_TOKEN_TTL")
                .value_parser(clap::value_parser!(u64).range(1..)),
        );

    gate::with_args(command)
}

fn hash() -> Command {
    Command::new(CMD_HASH)
        .about("Hash text with bcrypt")
        .arg(Arg::new(ARG_TEXT).help("Text to hash").required(true))
        .arg(
            Arg::new(ARG_COST)
                .long(ARG_COST)
                .help("bcrypt cost factor (4-31)")
                .default_value("12")
                .value_parser(clap::value_parser!(u32).range(4..=31)),
        )
}

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::GIT_COMMIT_HASH).into_boxed_str(),
    );

    let command = Command::new("tokengate")
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(serve())
        .subcommand(issue())
        .subcommand(hash());

    logging::with_args(command)
}
