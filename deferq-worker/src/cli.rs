/// Subcommands understood by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Load, validate and print the resolved configuration.
    CheckConfig,
    /// Run a recurring job against an in-memory backend.
    Demo,
}

/// Parsed command-line arguments.
#[derive(Debug, Default)]
pub struct CliArgs {
    pub command: Option<Command>,
    /// Path to configuration file, if provided via `--config-path` or `-c`.
    pub config_path: Option<String>,
    /// Backend override from `--backend`.
    pub backend: Option<String>,
    /// How long the demo runs, from `--seconds`.
    pub seconds: Option<u64>,
    /// Whether help was requested.
    pub help_requested: bool,
}

impl CliArgs {
    /// Parse the process arguments.
    pub fn parse() -> Result<Self, String> {
        let args: Vec<String> = std::env::args().collect();
        Self::parse_from(&args)
    }

    /// Parse `args`, where `args[0]` is the program name.
    ///
    /// Supported flags:
    /// - `--config-path <path>`, `--config-path=<path>`, `-c <path>` or `-c=<path>`
    /// - `--backend <rabbitmq|sqs>` or `--backend=<...>`
    /// - `--seconds <n>` or `--seconds=<n>`
    /// - `--help` or `-h`
    pub fn parse_from(args: &[String]) -> Result<Self, String> {
        let mut parsed = Self::default();
        let mut rest = args.iter().skip(1);

        while let Some(a) = rest.next() {
            if a == "--help" || a == "-h" {
                parsed.help_requested = true;
            } else if let Some(v) = flag_value(a, &["--config-path", "-c"], &mut rest)? {
                parsed.config_path = Some(v);
            } else if let Some(v) = flag_value(a, &["--backend"], &mut rest)? {
                parsed.backend = Some(v);
            } else if let Some(v) = flag_value(a, &["--seconds"], &mut rest)? {
                let seconds = v
                    .parse()
                    .map_err(|_| format!("--seconds expects a whole number, got '{v}'"))?;
                parsed.seconds = Some(seconds);
            } else if a.starts_with('-') {
                return Err(format!("unknown flag '{a}'"));
            } else if parsed.command.is_none() {
                parsed.command = Some(match a.as_str() {
                    "check-config" => Command::CheckConfig,
                    "demo" => Command::Demo,
                    other => return Err(format!("unknown command '{other}'")),
                });
            } else {
                return Err(format!("unexpected argument '{a}'"));
            }
        }
        Ok(parsed)
    }

    /// Print usage information to stderr.
    pub fn print_help() {
        eprintln!(
            "Usage: deferq-worker <check-config|demo> [--config-path PATH] [--backend rabbitmq|sqs] [--seconds N] [--help]\n\n\
             check-config         Load, validate and print the resolved configuration\n\
             demo                 Run a recurring job against an in-memory backend\n\n\
             --config-path, -c    Path to configuration file (overrides DEFERQ_CONFIG_PATH env var)\n\
             --backend            Override monitor.backend\n\
             --seconds            How long the demo runs (default 5)"
        );
    }
}

/// The value of `arg` if it is one of `names`, taken either from
/// `name=value` or from the next argument.
fn flag_value<'a>(
    arg: &str,
    names: &[&str],
    rest: &mut impl Iterator<Item = &'a String>,
) -> Result<Option<String>, String> {
    for name in names {
        if arg == *name {
            return match rest.next() {
                Some(v) => Ok(Some(v.clone())),
                None => Err(format!("{name} expects a value")),
            };
        }
        if let Some(v) = arg.strip_prefix(name).and_then(|s| s.strip_prefix('=')) {
            return Ok(Some(v.to_string()));
        }
    }
    Ok(None)
}
