use rand::Rng;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub hostname: String,
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
}

/// Ordered, round-robin iterator over transport endpoints with a failover
/// cursor. The cursor starts at a uniform-random index so a fleet of
/// clients doesn't converge on the same broker after a simultaneous
/// restart. Accessed only on the I/O thread after construction.
pub struct HostList {
    entries: Vec<HostEntry>,
    cursor: usize,
}

impl HostList {
    pub fn new(entries: Vec<HostEntry>) -> Self {
        assert!(!entries.is_empty(), "HostList requires at least one host");
        let cursor = rand::thread_rng().gen_range(0..entries.len());
        HostList { entries, cursor }
    }

    /// Parses `"host[:port]"` strings, defaulting port to 5672 and
    /// user/pass from the supplied config defaults.
    pub fn from_config_strings(
        hosts: &[String],
        default_port: u16,
        default_user: Option<String>,
        default_pass: Option<String>,
    ) -> Self {
        let entries = hosts
            .iter()
            .map(|h| {
                let (hostname, port) = match h.rsplit_once(':') {
                    Some((host, port)) => (
                        host.to_string(),
                        port.parse::<u16>().unwrap_or(default_port),
                    ),
                    None => (h.clone(), default_port),
                };
                HostEntry {
                    hostname,
                    port,
                    user: default_user.clone(),
                    pass: default_pass.clone(),
                }
            })
            .collect();
        HostList::new(entries)
    }

    pub fn current(&self) -> &HostEntry {
        &self.entries[self.cursor]
    }

    /// Advances the cursor modulo length (identity on single-entry lists).
    pub fn next(&mut self) -> &HostEntry {
        self.cursor = (self.cursor + 1) % self.entries.len();
        self.current()
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

    fn entry(host: &str) -> HostEntry {
        HostEntry {
            hostname: host.to_string(),
            port: 5672,
            user: None,
            pass: None,
        }
    }

    #[test]
    fn next_advances_modulo_length() {
        let mut hosts = HostList::new(vec![entry("a"), entry("b"), entry("c")]);
        let start = hosts.current().hostname.clone();
        let order: Vec<String> = (0..3).map(|_| hosts.next().hostname.clone()).collect();
        assert_eq!(order.len(), 3);
        assert_eq!(hosts.current().hostname, start);
    }

    #[test]
    fn single_entry_is_identity() {
        let mut hosts = HostList::new(vec![entry("only")]);
        assert_eq!(hosts.next().hostname, "only");
        assert_eq!(hosts.next().hostname, "only");
    }

    #[test]
    fn from_config_strings_defaults_port() {
        let hosts = HostList::from_config_strings(&["broker.example".to_string()], 5672, None, None);
        assert_eq!(hosts.current().port, 5672);
    }

    #[test]
    fn from_config_strings_parses_explicit_port() {
        let hosts =
            HostList::from_config_strings(&["broker.example:5673".to_string()], 5672, None, None);
        assert_eq!(hosts.current().port, 5673);
        assert_eq!(hosts.current().hostname, "broker.example");
    }
}
