//! Dynamic command registry built on the `clap` builder API.
//!
//! Callers register command definitions by name, parse once, and read
//! values back through typed accessors. The registry keeps the parsed
//! snapshot for the rest of the process; repeated parse calls return the
//! cached result.

use std::collections::HashMap;
use std::ffi::OsString;

use clap::builder::{PossibleValue, PossibleValuesParser};
use clap::parser::ValueSource;
use clap::{Arg, ArgAction, ArgMatches, Command};
use thiserror::Error;
use tracing::warn;

use super::VERBOSITY_CHOICES;

pub const CMD_ENDPOINT: &str = "endpoint";
pub const CMD_CA_FILE: &str = "ca_file";
pub const CMD_CERT: &str = "cert";
pub const CMD_KEY: &str = "key";
pub const CMD_PORT: &str = "port";
pub const CMD_CLIENT_ID: &str = "client_id";
pub const CMD_TOPIC: &str = "topic";
pub const CMD_MESSAGE: &str = "message";
pub const CMD_COUNT: &str = "count";
pub const CMD_PROXY_HOST: &str = "proxy_host";
pub const CMD_PROXY_PORT: &str = "proxy_port";
pub const CMD_SIGNING_REGION: &str = "signing_region";
pub const CMD_VERBOSITY: &str = "verbosity";
pub const CMD_CONFIG: &str = "config";
pub const CMD_PKCS11_LIB: &str = "pkcs11_lib";
pub const CMD_PKCS11_PIN: &str = "pin";
pub const CMD_PKCS11_TOKEN: &str = "token_label";
pub const CMD_PKCS11_SLOT: &str = "slot_id";
pub const CMD_PKCS11_KEY: &str = "key_label";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Command --{0} required.")]
    MissingCommand(String),

    #[error("Commands have not been parsed yet")]
    NotParsed,
}

/// How a command's value is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Text,
    Integer,
    Flag,
}

/// A single registered command definition.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub name: String,
    pub example: String,
    pub help: String,
    pub required: bool,
    pub kind: ValueKind,
    pub default: Option<String>,
    pub choices: Option<Vec<String>>,
}

impl CommandSpec {
    pub fn text(name: &str, example: &str, help: &str) -> Self {
        Self {
            name: name.to_string(),
            example: example.to_string(),
            help: help.to_string(),
            required: false,
            kind: ValueKind::Text,
            default: None,
            choices: None,
        }
    }

    pub fn integer(name: &str, example: &str, help: &str) -> Self {
        Self {
            kind: ValueKind::Integer,
            ..Self::text(name, example, help)
        }
    }

    pub fn flag(name: &str, help: &str) -> Self {
        Self {
            kind: ValueKind::Flag,
            ..Self::text(name, "", help)
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default_value(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn choices(mut self, choices: &[&str]) -> Self {
        self.choices = Some(choices.iter().map(|c| c.to_string()).collect());
        self
    }
}

/// A parsed command value.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandValue {
    Text(String),
    Integer(i64),
    Flag(bool),
}

#[derive(Debug, Clone)]
struct ParsedValue {
    value: CommandValue,
    from_command_line: bool,
}

/// Immutable snapshot of resolved values, computed once per registry.
#[derive(Debug, Clone, Default)]
pub struct ParsedCommands {
    values: HashMap<String, ParsedValue>,
}

impl ParsedCommands {
    pub fn get(&self, name: &str) -> Option<&CommandValue> {
        self.values.get(name).map(|parsed| &parsed.value)
    }

    pub fn text(&self, name: &str) -> Option<String> {
        match self.get(name)? {
            CommandValue::Text(value) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn integer(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            CommandValue::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn flag(&self, name: &str) -> bool {
        matches!(self.get(name), Some(CommandValue::Flag(true)))
    }

    /// True when the value was supplied on the command line rather than
    /// filled in from a registered default.
    pub fn provided(&self, name: &str) -> bool {
        self.values
            .get(name)
            .map(|parsed| parsed.from_command_line)
            .unwrap_or(false)
    }
}

/// Ordered add-or-overwrite collection of command definitions with a
/// parse-once cache.
pub struct CommandRegistry {
    name: String,
    description: String,
    commands: Vec<CommandSpec>,
    parsed: Option<ParsedCommands>,
}

impl CommandRegistry {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            commands: Vec::new(),
            parsed: None,
        }
    }

    /// Adds a definition, overwriting any previous one with the same name.
    pub fn register(&mut self, spec: CommandSpec) {
        match self.commands.iter_mut().find(|c| c.name == spec.name) {
            Some(existing) => *existing = spec,
            None => self.commands.push(spec),
        }
    }

    /// Removes a definition. Returns false when the name was never
    /// registered.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.commands.len();
        self.commands.retain(|c| c.name != name);
        self.commands.len() != before
    }

    /// Patches individual fields of an existing definition.
    pub fn update<F>(&mut self, name: &str, patch: F) -> bool
    where
        F: FnOnce(&mut CommandSpec),
    {
        if self.parsed.is_some() {
            warn!("Commands already parsed; update to --{} has no effect", name);
        }
        match self.commands.iter_mut().find(|c| c.name == name) {
            Some(spec) => {
                patch(spec);
                true
            }
            None => false,
        }
    }

    /// Endpoint and CA bundle, shared by every MQTT sample.
    pub fn with_mqtt_commands(mut self) -> Self {
        self.register(CommandSpec::text(
            CMD_ENDPOINT,
            "<str>",
            "The endpoint of the mqtt server not including a port.",
        ));
        self.register(CommandSpec::text(
            CMD_CA_FILE,
            "<path>",
            "Path to a CA bundle in PEM format (optional, system trust store used by default).",
        ));
        self
    }

    /// Topic and message payload commands.
    pub fn with_topic_message_commands(mut self) -> Self {
        self.register(
            CommandSpec::text(
                CMD_TOPIC,
                "<str>",
                "Topic to publish, subscribe to (optional, default='test/topic').",
            )
            .default_value("test/topic"),
        );
        self.register(
            CommandSpec::text(
                CMD_MESSAGE,
                "<str>",
                "The message to send in the payload (optional, default='Hello World!').",
            )
            .default_value("Hello World!"),
        );
        self
    }

    /// HTTP proxy commands.
    pub fn with_proxy_commands(mut self) -> Self {
        self.register(CommandSpec::text(
            CMD_PROXY_HOST,
            "<str>",
            "Host name of the proxy server to connect through (optional).",
        ));
        self.register(
            CommandSpec::integer(
                CMD_PROXY_PORT,
                "<int>",
                "Port of the http proxy to use (optional, default='8080').",
            )
            .default_value("8080"),
        );
        self
    }

    /// Logging verbosity command.
    pub fn with_logging_commands(mut self) -> Self {
        self.register(
            CommandSpec::text(CMD_VERBOSITY, "<Log Level>", "Logging level.")
                .default_value("off")
                .choices(&VERBOSITY_CHOICES),
        );
        self
    }

    /// Commands for credentials held in a PKCS#11 token.
    pub fn with_pkcs11_commands(mut self) -> Self {
        self.register(CommandSpec::text(
            CMD_PKCS11_LIB,
            "<path>",
            "Path to the PKCS#11 library.",
        ));
        self.register(CommandSpec::text(
            CMD_PKCS11_PIN,
            "<str>",
            "User PIN for logging into the PKCS#11 token.",
        ));
        self.register(CommandSpec::text(
            CMD_PKCS11_TOKEN,
            "<str>",
            "Label of the PKCS#11 token to use (optional).",
        ));
        self.register(CommandSpec::integer(
            CMD_PKCS11_SLOT,
            "<int>",
            "Slot ID containing the PKCS#11 token to use (optional).",
        ));
        self.register(CommandSpec::text(
            CMD_PKCS11_KEY,
            "<str>",
            "Label of the private key on the PKCS#11 token (optional).",
        ));
        self
    }

    /// Parses the process arguments, exiting with usage on failure.
    ///
    /// Parsing is performed at most once; later calls return the cached
    /// snapshot.
    pub fn parse(&mut self) -> &ParsedCommands {
        if self.parsed.is_none() {
            let matches = self.build_command().get_matches();
            self.parsed = Some(self.snapshot(&matches));
        }
        self.parsed.as_ref().expect("parse cache populated")
    }

    /// Fallible variant of [`parse`](Self::parse) over explicit arguments.
    pub fn try_parse_from<I, T>(&mut self, argv: I) -> Result<&ParsedCommands, RegistryError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        if self.parsed.is_none() {
            let matches = self
                .build_command()
                .try_get_matches_from(argv)
                .map_err(|e| RegistryError::Usage(e.to_string()))?;
            self.parsed = Some(self.snapshot(&matches));
        }
        Ok(self.parsed.as_ref().expect("parse cache populated"))
    }

    pub fn parsed(&self) -> Option<&ParsedCommands> {
        self.parsed.as_ref()
    }

    pub fn text(&self, name: &str) -> Option<String> {
        self.parsed.as_ref()?.text(name)
    }

    pub fn integer(&self, name: &str) -> Option<i64> {
        self.parsed.as_ref()?.integer(name)
    }

    pub fn flag(&self, name: &str) -> bool {
        self.parsed.as_ref().map(|p| p.flag(name)).unwrap_or(false)
    }

    pub fn provided(&self, name: &str) -> bool {
        self.parsed
            .as_ref()
            .map(|p| p.provided(name))
            .unwrap_or(false)
    }

    /// Returns the parsed value or terminates the process after printing
    /// help and naming the missing command.
    pub fn required_text(&self, name: &str) -> String {
        match self.try_required_text(name) {
            Ok(value) => value,
            Err(_) => self.exit_missing(name),
        }
    }

    pub fn try_required_text(&self, name: &str) -> Result<String, RegistryError> {
        if self.parsed.is_none() {
            return Err(RegistryError::NotParsed);
        }
        self.text(name)
            .ok_or_else(|| RegistryError::MissingCommand(name.to_string()))
    }

    /// Prints help, reports the missing command and exits.
    pub fn exit_missing(&self, name: &str) -> ! {
        let mut command = self.build_command();
        let _ = command.print_help();
        eprintln!("Command --{name} required.");
        std::process::exit(1);
    }

    fn build_command(&self) -> Command {
        let mut command = Command::new(self.name.clone()).about(self.description.clone());
        for spec in &self.commands {
            let mut arg = Arg::new(spec.name.clone())
                .long(spec.name.clone())
                .help(spec.help.clone());
            arg = match spec.kind {
                ValueKind::Flag => arg.action(ArgAction::SetTrue),
                ValueKind::Integer => arg
                    .value_name(spec.example.clone())
                    .value_parser(clap::value_parser!(i64)),
                ValueKind::Text => {
                    let arg = arg.value_name(spec.example.clone());
                    match &spec.choices {
                        Some(choices) => arg.value_parser(PossibleValuesParser::new(
                            choices.iter().map(|c| PossibleValue::new(c.clone())),
                        )),
                        None => arg,
                    }
                }
            };
            if let Some(default) = &spec.default {
                arg = arg.default_value(default.clone());
            }
            // clap rejects arguments that are required yet carry a default
            arg = arg.required(spec.required && spec.default.is_none());
            command = command.arg(arg);
        }
        command
    }

    fn snapshot(&self, matches: &ArgMatches) -> ParsedCommands {
        let mut values = HashMap::new();
        for spec in &self.commands {
            let value = match spec.kind {
                ValueKind::Flag => Some(CommandValue::Flag(matches.get_flag(&spec.name))),
                ValueKind::Integer => matches
                    .get_one::<i64>(&spec.name)
                    .map(|v| CommandValue::Integer(*v)),
                ValueKind::Text => matches
                    .get_one::<String>(&spec.name)
                    .map(|v| CommandValue::Text(v.clone())),
            };
            if let Some(value) = value {
                let from_command_line =
                    matches.value_source(&spec.name) == Some(ValueSource::CommandLine);
                values.insert(
                    spec.name.clone(),
                    ParsedValue {
                        value,
                        from_command_line,
                    },
                );
            }
        }
        ParsedCommands { values }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_registry() -> CommandRegistry {
        let mut registry = CommandRegistry::new("probe", "test registry")
            .with_mqtt_commands()
            .with_topic_message_commands();
        registry.register(
            CommandSpec::integer(CMD_COUNT, "<int>", "messages to send").default_value("10"),
        );
        registry.register(CommandSpec::flag("dry_run", "parse only"));
        registry
    }

    #[test]
    fn parsed_values_round_trip() {
        let mut registry = sample_registry();
        let parsed = registry
            .try_parse_from([
                "probe",
                "--endpoint",
                "example.com",
                "--count",
                "3",
                "--dry_run",
            ])
            .unwrap();

        assert_eq!(parsed.text(CMD_ENDPOINT).as_deref(), Some("example.com"));
        assert_eq!(parsed.integer(CMD_COUNT), Some(3));
        assert!(parsed.flag("dry_run"));
        assert!(parsed.provided(CMD_ENDPOINT));
    }

    #[test]
    fn defaults_surface_without_being_provided() {
        let mut registry = sample_registry();
        let parsed = registry
            .try_parse_from(["probe", "--endpoint", "example.com"])
            .unwrap();

        assert_eq!(parsed.text(CMD_TOPIC).as_deref(), Some("test/topic"));
        assert_eq!(parsed.text(CMD_MESSAGE).as_deref(), Some("Hello World!"));
        assert_eq!(parsed.integer(CMD_COUNT), Some(10));
        assert!(!parsed.provided(CMD_TOPIC));
    }

    #[test]
    fn missing_required_command_is_a_usage_error() {
        let mut registry = CommandRegistry::new("probe", "test registry");
        registry.register(CommandSpec::text("must", "<str>", "mandatory").required());

        let result = registry.try_parse_from(["probe"]);
        assert!(matches!(result, Err(RegistryError::Usage(_))));
    }

    #[test]
    fn choices_reject_unknown_values() {
        let mut registry = CommandRegistry::new("probe", "test registry").with_logging_commands();

        let result = registry.try_parse_from(["probe", "--verbosity", "loud"]);
        assert!(matches!(result, Err(RegistryError::Usage(_))));
    }

    #[test]
    fn parse_is_cached_after_the_first_call() {
        let mut registry = sample_registry();
        registry
            .try_parse_from(["probe", "--endpoint", "first.example.com"])
            .unwrap();
        let parsed = registry
            .try_parse_from(["probe", "--endpoint", "second.example.com"])
            .unwrap();

        assert_eq!(
            parsed.text(CMD_ENDPOINT).as_deref(),
            Some("first.example.com")
        );
    }

    #[test]
    fn register_overwrites_by_name() {
        let mut registry = sample_registry();
        registry.register(
            CommandSpec::text(CMD_TOPIC, "<str>", "replacement topic").default_value("alt/topic"),
        );

        let parsed = registry
            .try_parse_from(["probe", "--endpoint", "example.com"])
            .unwrap();
        assert_eq!(parsed.text(CMD_TOPIC).as_deref(), Some("alt/topic"));
    }

    #[test]
    fn update_patches_individual_fields() {
        let mut registry = sample_registry();
        let patched = registry.update(CMD_MESSAGE, |spec| {
            spec.default = Some("Goodbye!".to_string());
        });
        assert!(patched);

        let parsed = registry
            .try_parse_from(["probe", "--endpoint", "example.com"])
            .unwrap();
        assert_eq!(parsed.text(CMD_MESSAGE).as_deref(), Some("Goodbye!"));
    }

    #[test]
    fn removed_commands_are_rejected_at_parse() {
        let mut registry = sample_registry();
        assert!(registry.remove("dry_run"));

        let result = registry.try_parse_from(["probe", "--endpoint", "e", "--dry_run"]);
        assert!(matches!(result, Err(RegistryError::Usage(_))));
    }

    #[test]
    fn required_accessor_reports_absent_optionals() {
        let mut registry = sample_registry();
        registry
            .try_parse_from(["probe", "--endpoint", "example.com"])
            .unwrap();

        assert!(matches!(
            registry.try_required_text(CMD_CA_FILE),
            Err(RegistryError::MissingCommand(name)) if name == CMD_CA_FILE
        ));
        assert_eq!(
            registry.try_required_text(CMD_ENDPOINT).unwrap(),
            "example.com"
        );
    }
}
