use std::fmt;

/// Target token that addresses every live session (`@public:<body>`).
pub const EVERYONE: &str = "public";

/// Sender tag used in history replay for the requester's own messages.
pub const HISTORY_SELF: &str = "ME";

/// Literal message a client sends to log out.
pub const DISCONNECT: &str = "disconnect";

/// The addressing target of a history request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HistoryScope {
    /// Messages addressed to everyone.
    Public,
    /// Messages sent to the named group.
    Group(String),
    /// Direct messages exchanged with the named user.
    User(String),
}

impl HistoryScope {
    /// Parses the text after `HISTORY:`.
    ///
    /// `All` is accepted as an alias for `public`, which is what the sidebar
    /// of older clients sends.
    pub fn parse(scope: &str) -> Self {
        if scope == "public" || scope == "All" {
            HistoryScope::Public
        } else if let Some(group) = scope.strip_prefix("group:") {
            HistoryScope::Group(group.to_string())
        } else {
            HistoryScope::User(scope.to_string())
        }
    }
}

impl fmt::Display for HistoryScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistoryScope::Public => f.write_str("public"),
            HistoryScope::Group(group) => write!(f, "group:{group}"),
            HistoryScope::User(user) => f.write_str(user),
        }
    }
}

// ============================================================================
// Client to Server
// ============================================================================

/// A decoded client-originated message.
///
/// Carries no sender: the router attributes every command to the name the
/// sending connection is registered under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// `HISTORY:<scope>`
    History(HistoryScope),
    /// `@public:<body>` or any unprefixed text.
    Public { body: String },
    /// `@<name>:<body>`
    Direct { recipient: String, body: String },
    /// `GROUP:<group>:<body>`
    Group { group: String, body: String },
    /// `disconnect`
    Disconnect,
}

impl ClientCommand {
    /// Decodes one framed message, applying the dispatch priority:
    /// history request, `@`-addressed, group-addressed, then public.
    pub fn decode(line: &str) -> Self {
        if line == DISCONNECT {
            return ClientCommand::Disconnect;
        }

        if let Some(scope) = line.strip_prefix("HISTORY:") {
            return ClientCommand::History(HistoryScope::parse(scope));
        }

        if let Some((target, body)) = line.strip_prefix('@').and_then(|r| r.split_once(':')) {
            if target.to_lowercase() == EVERYONE {
                return ClientCommand::Public {
                    body: body.to_string(),
                };
            }
            return ClientCommand::Direct {
                recipient: target.to_string(),
                body: body.to_string(),
            };
        }

        if let Some((group, body)) = line.strip_prefix("GROUP:").and_then(|r| r.split_once(':')) {
            return ClientCommand::Group {
                group: group.to_string(),
                body: body.to_string(),
            };
        }

        ClientCommand::Public {
            body: line.to_string(),
        }
    }
}

// ============================================================================
// Server to Client
// ============================================================================

/// A server-originated message, encoded as one `\n`-terminated line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// `CLIENT_LIST:<csv>` - the roster of live names.
    ClientList(Vec<String>),
    /// `ALL_USERS:<csv>` - every registered name except the recipient.
    AllUsers(Vec<String>),
    /// `PUBLIC:<sender>:<body>`
    Public { sender: String, body: String },
    /// `PRIVATE:<sender>:<body>`
    Private { sender: String, body: String },
    /// `GROUP:<group>:<sender>:<body>`
    Group {
        group: String,
        sender: String,
        body: String,
    },
    /// `HISTORY:<sender-or-ME>:<body>`
    History {
        sender: String,
        body: String,
        own: bool,
    },
}

impl ServerMessage {
    pub fn encode(&self) -> String {
        match self {
            ServerMessage::ClientList(names) => format!("CLIENT_LIST:{}\n", names.join(",")),
            ServerMessage::AllUsers(names) => format!("ALL_USERS:{}\n", names.join(",")),
            ServerMessage::Public { sender, body } => format!("PUBLIC:{sender}:{body}\n"),
            ServerMessage::Private { sender, body } => format!("PRIVATE:{sender}:{body}\n"),
            ServerMessage::Group {
                group,
                sender,
                body,
            } => format!("GROUP:{group}:{sender}:{body}\n"),
            ServerMessage::History { sender, body, own } => {
                let tag = if *own { HISTORY_SELF } else { sender.as_str() };
                format!("HISTORY:{tag}:{body}\n")
            }
        }
    }
}
