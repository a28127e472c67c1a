//! LISTEN channel registrations.

use postgres_protocol::escape::escape_identifier;

/// Separator for batched LISTEN / UNLISTEN commands.
pub const BATCH_SEPARATOR: &str = ";\n";

/// A subscription to backend notifications on one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenRegistration {
    channel: String,
    command: String,
}

impl ListenRegistration {
    pub fn new(channel: impl Into<String>) -> Self {
        let channel = channel.into();
        let command = format!("LISTEN {}", escape_identifier(&channel));
        Self { channel, command }
    }

    /// Parse the channel out of a `LISTEN <channel>` statement.
    ///
    /// Unquoted names fold to lower case the way the server folds them, so
    /// the registration matches the channel name notifications carry.
    pub fn from_statement(sql: &str) -> Option<Self> {
        let trimmed = sql.trim_start();
        match trimmed.get(..7) {
            Some(keyword) if keyword.eq_ignore_ascii_case("LISTEN ") => {}
            _ => return None,
        }
        let raw = trimmed[7..].trim().trim_end_matches(';').trim();
        if raw.is_empty() {
            return None;
        }
        let channel = if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
            raw[1..raw.len() - 1].replace("\"\"", "\"")
        } else {
            raw.to_lowercase()
        };
        Some(Self::new(channel))
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn subscribe_command(&self) -> &str {
        &self.command
    }

    pub fn unsubscribe_command(&self) -> String {
        format!("UN{}", self.command)
    }
}

/// Join commands into one simple-protocol batch.
pub fn batch<I, S>(commands: I) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::new();
    for command in commands {
        if !out.is_empty() {
            out.push_str(BATCH_SEPARATOR);
        }
        out.push_str(command.as_ref());
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Registrations held by one backend session, unique by channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenSet {
    entries: Vec<ListenRegistration>,
}

impl ListenSet {
    pub fn contains(&self, channel: &str) -> bool {
        self.entries.iter().any(|r| r.channel == channel)
    }

    /// Returns false when the channel was already registered.
    pub fn insert(&mut self, registration: ListenRegistration) -> bool {
        if self.contains(&registration.channel) {
            return false;
        }
        self.entries.push(registration);
        true
    }

    /// Merge registrations, returning the ones that were not present yet.
    pub fn merge<I>(&mut self, registrations: I) -> Vec<ListenRegistration>
    where
        I: IntoIterator<Item = ListenRegistration>,
    {
        let mut added = Vec::new();
        for registration in registrations {
            if self.insert(registration.clone()) {
                added.push(registration);
            }
        }
        added
    }

    pub fn remove(&mut self, channel: &str) -> Option<ListenRegistration> {
        let index = self.entries.iter().position(|r| r.channel == channel)?;
        Some(self.entries.remove(index))
    }

    pub fn take(&mut self) -> Vec<ListenRegistration> {
        std::mem::take(&mut self.entries)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ListenRegistration> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_statement() {
        let reg = ListenRegistration::from_statement("listen Orders;").unwrap();
        assert_eq!(reg.channel(), "orders");
        assert_eq!(reg.subscribe_command(), "LISTEN \"orders\"");
        assert_eq!(reg.unsubscribe_command(), "UNLISTEN \"orders\"");

        let quoted = ListenRegistration::from_statement("LISTEN \"Mixed\"\"Case\"").unwrap();
        assert_eq!(quoted.channel(), "Mixed\"Case");

        assert!(ListenRegistration::from_statement("SELECT 1").is_none());
        assert!(ListenRegistration::from_statement("LISTEN ").is_none());
    }

    #[test]
    fn test_merge_suppresses_duplicates() {
        let mut set = ListenSet::default();
        set.insert(ListenRegistration::new("x"));
        let added = set.merge(vec![ListenRegistration::new("x"), ListenRegistration::new("y")]);
        assert_eq!(added, vec![ListenRegistration::new("y")]);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_batch_joins_commands() {
        let regs = [ListenRegistration::new("a"), ListenRegistration::new("b")];
        let joined = batch(regs.iter().map(|r| r.unsubscribe_command())).unwrap();
        assert_eq!(joined, "UNLISTEN \"a\";\nUNLISTEN \"b\"");
        assert!(batch(Vec::<String>::new()).is_none());
    }
}
