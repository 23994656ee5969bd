//! Input router for turning chat messages into shell input.
//!
//! This module provides the [`InputRouter`], which checks each inbound
//! message against the [`AuthorizationPolicy`] and the command grammar and
//! writes the result to the shell's terminal.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::auth::AuthorizationPolicy;
use crate::config::InputConfig;
use crate::session::{PtyError, ShellInput};

/// Errors that can occur while routing input.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Writing to the terminal failed.
    #[error("pty error: {0}")]
    Pty(#[from] PtyError),
}

/// Control characters that can be sent by token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    /// Ctrl-C.
    Interrupt,
    /// Ctrl-D.
    EndOfFile,
}

impl ControlKind {
    /// The byte written to the terminal.
    pub fn byte(self) -> u8 {
        match self {
            ControlKind::Interrupt => 0x03,
            ControlKind::EndOfFile => 0x04,
        }
    }
}

/// How an inbound message was interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundCommand {
    /// Text for the shell; written followed by a newline.
    PlainInput(String),
    /// A control character.
    ControlSignal(ControlKind),
    /// The sender is not on the allow-list.
    Unauthorized,
    /// Not meant for the shell (missing prefix, or our own echo).
    Ignored,
}

/// Grammar applied to authorized messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandGrammar {
    /// Messages without the prefix are ignored.
    pub require_prefix: bool,
    /// Stripped from the front of commands when present.
    pub prefix: Option<String>,
    /// Exact message that sends Ctrl-C.
    pub interrupt_token: String,
    /// Exact message that sends Ctrl-D.
    pub eof_token: String,
}

impl Default for CommandGrammar {
    fn default() -> Self {
        Self::from(&InputConfig::default())
    }
}

impl From<&InputConfig> for CommandGrammar {
    fn from(config: &InputConfig) -> Self {
        Self {
            require_prefix: config.require_prefix,
            prefix: config.prefix.clone().filter(|p| !p.is_empty()),
            interrupt_token: config.interrupt_token.clone(),
            eof_token: config.eof_token.clone(),
        }
    }
}

impl CommandGrammar {
    /// Interprets a message from an authorized sender.
    pub fn parse(&self, text: &str) -> InboundCommand {
        if text == self.interrupt_token {
            return InboundCommand::ControlSignal(ControlKind::Interrupt);
        }
        if text == self.eof_token {
            return InboundCommand::ControlSignal(ControlKind::EndOfFile);
        }

        if let Some(prefix) = self.prefix.as_deref() {
            if let Some(rest) = text.strip_prefix(prefix) {
                return InboundCommand::PlainInput(rest.to_string());
            }
        }

        if self.require_prefix {
            InboundCommand::Ignored
        } else {
            InboundCommand::PlainInput(text.to_string())
        }
    }
}

/// Routes chat messages into the shell.
pub struct InputRouter<W: ShellInput> {
    /// Who may write.
    policy: Arc<AuthorizationPolicy>,
    /// What they may write.
    grammar: CommandGrammar,
    /// Where it goes.
    input: Arc<W>,
    /// Bridge account; its own messages are never routed.
    own_user: Option<String>,
}

impl<W: ShellInput> InputRouter<W> {
    /// Create a new input router.
    pub fn new(policy: Arc<AuthorizationPolicy>, grammar: CommandGrammar, input: Arc<W>) -> Self {
        Self {
            policy,
            grammar,
            input,
            own_user: None,
        }
    }

    /// Ignore messages sent by `user_id` (the bridge's own account).
    pub fn with_own_user(mut self, user_id: impl Into<String>) -> Self {
        self.own_user = Some(user_id.into());
        self
    }

    /// Decides what a message means without touching the shell.
    pub fn classify(&self, sender: &str, text: &str) -> InboundCommand {
        if self.own_user.as_deref() == Some(sender) {
            return InboundCommand::Ignored;
        }
        if !self.policy.is_allowed(sender) {
            return InboundCommand::Unauthorized;
        }
        self.grammar.parse(text)
    }

    /// Classifies a message and performs the resulting write.
    ///
    /// Plain input is written with a trailing newline; control signals are
    /// written as the single control byte. Nothing is written for
    /// unauthorized or ignored messages.
    pub fn route(&self, sender: &str, room_id: &str, text: &str) -> Result<InboundCommand, RouterError> {
        let command = self.classify(sender, text);

        match &command {
            InboundCommand::PlainInput(input) => {
                let mut line = Vec::with_capacity(input.len() + 1);
                line.extend_from_slice(input.as_bytes());
                line.push(b'\n');
                self.input.write_input(&line)?;
                debug!(sender, room_id, bytes = line.len(), "Forwarded input to shell");
            }
            InboundCommand::ControlSignal(kind) => {
                self.input.write_input(&[kind.byte()])?;
                debug!(sender, room_id, signal = ?kind, "Sent control character");
            }
            InboundCommand::Unauthorized => {
                debug!(sender, room_id, "Ignoring message from unauthorized sender");
            }
            InboundCommand::Ignored => {
                trace!(sender, room_id, "Ignoring message");
            }
        }

        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mock terminal input recording every write.
    #[derive(Default)]
    struct MockInput {
        writes: Mutex<Vec<Vec<u8>>>,
        should_fail: bool,
    }

    impl MockInput {
        fn failing() -> Self {
            Self {
                should_fail: true,
                ..Default::default()
            }
        }

        fn writes(&self) -> Vec<Vec<u8>> {
            self.writes.lock().unwrap().clone()
        }
    }

    impl ShellInput for MockInput {
        fn write_input(&self, data: &[u8]) -> Result<(), PtyError> {
            if self.should_fail {
                return Err(PtyError::ChildExited);
            }
            self.writes.lock().unwrap().push(data.to_vec());
            Ok(())
        }
    }

    const ALICE: &str = "@alice:example.org";
    const MALLORY: &str = "@mallory:example.org";
    const ROOM: &str = "!ops:example.org";

    fn create_test_router(grammar: CommandGrammar) -> (InputRouter<MockInput>, Arc<MockInput>) {
        let input = Arc::new(MockInput::default());
        let policy = Arc::new(AuthorizationPolicy::new([ALICE]));
        let router = InputRouter::new(policy, grammar, Arc::clone(&input));
        (router, input)
    }

    fn prefixed(require_prefix: bool) -> CommandGrammar {
        CommandGrammar {
            require_prefix,
            prefix: Some("$ ".to_string()),
            ..CommandGrammar::default()
        }
    }

    #[test]
    fn test_route_plain_input() {
        let (router, input) = create_test_router(CommandGrammar::default());

        let command = router.route(ALICE, ROOM, "ls -la").unwrap();

        assert_eq!(command, InboundCommand::PlainInput("ls -la".to_string()));
        assert_eq!(input.writes(), vec![b"ls -la\n".to_vec()]);
    }

    #[test]
    fn test_route_unauthorized_writes_nothing() {
        let (router, input) = create_test_router(CommandGrammar::default());

        let command = router.route(MALLORY, ROOM, "rm -rf /").unwrap();

        assert_eq!(command, InboundCommand::Unauthorized);
        assert!(input.writes().is_empty());
    }

    #[test]
    fn test_route_unauthorized_control_token() {
        let (router, input) = create_test_router(CommandGrammar::default());

        assert_eq!(
            router.route(MALLORY, ROOM, "!ctrlc").unwrap(),
            InboundCommand::Unauthorized
        );
        assert!(input.writes().is_empty());
    }

    #[test]
    fn test_route_interrupt_writes_single_byte() {
        let (router, input) = create_test_router(CommandGrammar::default());

        let command = router.route(ALICE, ROOM, "!ctrlc").unwrap();

        assert_eq!(command, InboundCommand::ControlSignal(ControlKind::Interrupt));
        assert_eq!(input.writes(), vec![vec![0x03]]);
    }

    #[test]
    fn test_route_eof_writes_single_byte() {
        let (router, input) = create_test_router(CommandGrammar::default());

        router.route(ALICE, ROOM, "!ctrld").unwrap();
        assert_eq!(input.writes(), vec![vec![0x04]]);
    }

    #[test]
    fn test_control_token_must_match_exactly() {
        let (router, input) = create_test_router(CommandGrammar::default());

        router.route(ALICE, ROOM, "!ctrlc now").unwrap();
        assert_eq!(input.writes(), vec![b"!ctrlc now\n".to_vec()]);
    }

    #[test]
    fn test_route_multiline_written_as_is() {
        let (router, input) = create_test_router(CommandGrammar::default());

        router.route(ALICE, ROOM, "echo a\necho b").unwrap();
        assert_eq!(input.writes(), vec![b"echo a\necho b\n".to_vec()]);
    }

    #[test]
    fn test_prefix_is_stripped() {
        let (router, input) = create_test_router(prefixed(false));

        let command = router.route(ALICE, ROOM, "$ uptime").unwrap();

        assert_eq!(command, InboundCommand::PlainInput("uptime".to_string()));
        assert_eq!(input.writes(), vec![b"uptime\n".to_vec()]);
    }

    #[test]
    fn test_optional_prefix_passes_plain_text() {
        let (router, _input) = create_test_router(prefixed(false));

        assert_eq!(
            router.classify(ALICE, "uptime"),
            InboundCommand::PlainInput("uptime".to_string())
        );
    }

    #[test]
    fn test_required_prefix_missing_is_ignored() {
        let (router, input) = create_test_router(prefixed(true));

        let command = router.route(ALICE, ROOM, "just chatting").unwrap();

        assert_eq!(command, InboundCommand::Ignored);
        assert!(input.writes().is_empty());
    }

    #[test]
    fn test_control_token_wins_over_required_prefix() {
        let (router, _input) = create_test_router(prefixed(true));

        assert_eq!(
            router.classify(ALICE, "!ctrlc"),
            InboundCommand::ControlSignal(ControlKind::Interrupt)
        );
    }

    #[test]
    fn test_own_messages_are_ignored() {
        let input = Arc::new(MockInput::default());
        let policy = Arc::new(AuthorizationPolicy::new([ALICE, "@bridge:example.org"]));
        let router = InputRouter::new(policy, CommandGrammar::default(), Arc::clone(&input))
            .with_own_user("@bridge:example.org");

        let command = router.route("@bridge:example.org", ROOM, "hi").unwrap();

        assert_eq!(command, InboundCommand::Ignored);
        assert!(input.writes().is_empty());
    }

    #[test]
    fn test_write_failure_is_reported() {
        let input = Arc::new(MockInput::failing());
        let policy = Arc::new(AuthorizationPolicy::new([ALICE]));
        let router = InputRouter::new(policy, CommandGrammar::default(), input);

        let err = router.route(ALICE, ROOM, "ls").unwrap_err();
        assert!(matches!(err, RouterError::Pty(PtyError::ChildExited)));
    }

    #[test]
    fn test_grammar_from_config() {
        let config = InputConfig {
            require_prefix: true,
            prefix: Some("!sh ".to_string()),
            interrupt_token: "!int".to_string(),
            eof_token: "!eof".to_string(),
        };
        let grammar = CommandGrammar::from(&config);

        assert_eq!(grammar.parse("!int"), InboundCommand::ControlSignal(ControlKind::Interrupt));
        assert_eq!(grammar.parse("!eof"), InboundCommand::ControlSignal(ControlKind::EndOfFile));
        assert_eq!(grammar.parse("!sh id"), InboundCommand::PlainInput("id".to_string()));
        assert_eq!(grammar.parse("id"), InboundCommand::Ignored);
    }
}
