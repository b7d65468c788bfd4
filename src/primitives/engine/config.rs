//! Parser for the engine's `key=value,key=(nested),key=[list]` configuration strings.

use super::{EngineError, EngineResult};

/// Value attached to one configuration item.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConfigValue {
    /// Bare key with no value (`create`).
    Flag,
    /// Plain scalar (`session_max=20000`).
    Scalar(String),
    /// Parenthesised group (`log=(enabled=true)`).
    Group(Vec<ConfigItem>),
    /// Bracketed list (`extensions=[local=(entry=x)]`).
    List(Vec<ConfigItem>),
}

/// One parsed item together with its original text.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConfigItem {
    /// Item key.
    pub key: String,
    /// Parsed value.
    pub value: ConfigValue,
    /// The item exactly as written, reused when forwarding passthrough settings.
    pub raw: String,
}

impl ConfigItem {
    fn scalar(&self) -> Option<&str> {
        match &self.value {
            ConfigValue::Scalar(s) => Some(s.as_str()),
            _ => None,
        }
    }

    fn group(&self) -> &[ConfigItem] {
        match &self.value {
            ConfigValue::Group(items) | ConfigValue::List(items) => items,
            _ => &[],
        }
    }
}

/// Parses a configuration string into its top-level items.
pub fn parse_config(text: &str) -> EngineResult<Vec<ConfigItem>> {
    let mut items = Vec::new();
    for piece in split_top_level(text)? {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        items.push(parse_item(piece)?);
    }
    Ok(items)
}

fn parse_item(piece: &str) -> EngineResult<ConfigItem> {
    let (key, value) = match piece.find('=') {
        Some(eq) => (piece[..eq].trim(), Some(piece[eq + 1..].trim())),
        None => (piece, None),
    };
    if key.is_empty() {
        return Err(EngineError::Invalid(format!("config item '{piece}' has no key")));
    }
    let value = match value {
        None => ConfigValue::Flag,
        Some(v) if v.starts_with('(') => ConfigValue::Group(parse_config(strip(v, '(', ')')?)?),
        Some(v) if v.starts_with('[') => ConfigValue::List(parse_config(strip(v, '[', ']')?)?),
        Some(v) => ConfigValue::Scalar(v.to_string()),
    };
    Ok(ConfigItem {
        key: key.to_string(),
        value,
        raw: piece.to_string(),
    })
}

fn strip(value: &str, open: char, close: char) -> EngineResult<&str> {
    if value.len() >= 2 && value.starts_with(open) && value.ends_with(close) {
        Ok(&value[1..value.len() - 1])
    } else {
        Err(EngineError::Invalid(format!(
            "config value '{value}' is not enclosed in {open}{close}"
        )))
    }
}

fn split_top_level(text: &str) -> EngineResult<Vec<&str>> {
    let mut pieces = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (idx, ch) in text.char_indices() {
        match ch {
            '(' | '[' => depth += 1,
            ')' | ']' => {
                depth -= 1;
                if depth < 0 {
                    return Err(EngineError::Invalid(format!(
                        "unbalanced '{ch}' in config '{text}'"
                    )));
                }
            }
            ',' if depth == 0 => {
                pieces.push(&text[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(EngineError::Invalid(format!(
            "unclosed group in config '{text}'"
        )));
    }
    pieces.push(&text[start..]);
    Ok(pieces)
}

/// Parses sizes such as `2GB`, `1G`, `512M` or `4096`.
pub fn parse_size(text: &str) -> EngineResult<u64> {
    let upper = text.trim().to_ascii_uppercase();
    let digits_end = upper
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(upper.len());
    let (digits, suffix) = upper.split_at(digits_end);
    let base: u64 = digits
        .parse()
        .map_err(|_| EngineError::Invalid(format!("invalid size '{text}'")))?;
    let scale: u64 = match suffix.trim_end_matches('B') {
        "" => 1,
        "K" => 1 << 10,
        "M" => 1 << 20,
        "G" => 1 << 30,
        "T" => 1 << 40,
        _ => return Err(EngineError::Invalid(format!("invalid size suffix in '{text}'"))),
    };
    base.checked_mul(scale)
        .ok_or_else(|| EngineError::Invalid(format!("size '{text}' overflows")))
}

fn parse_bool(item: &ConfigItem) -> EngineResult<bool> {
    match item.scalar() {
        None if item.value == ConfigValue::Flag => Ok(true),
        Some("true") | Some("1") => Ok(true),
        Some("false") | Some("0") => Ok(false),
        _ => Err(EngineError::Invalid(format!(
            "'{}' expects a boolean",
            item.key
        ))),
    }
}

fn parse_u64(item: &ConfigItem) -> EngineResult<u64> {
    item.scalar()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| EngineError::Invalid(format!("'{}' expects an integer", item.key)))
}

/// Journal settings from `log=(...)`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogConfig {
    /// Journal commits.
    pub enabled: bool,
    /// Keep journal files after a checkpoint instead of truncating them.
    pub archive: bool,
    /// Journal directory relative to the home directory.
    pub path: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            archive: true,
            path: "journal".to_string(),
        }
    }
}

/// Checkpoint triggers from `checkpoint=(...)`; zero disables a trigger.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CheckpointConfig {
    /// Checkpoint every this many seconds.
    pub wait_secs: u64,
    /// Checkpoint once the journal grows past this many bytes.
    pub log_size: u64,
}

/// Recognised connection-open settings plus everything passed through verbatim.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OpenConfig {
    /// Create the home directory when it is missing.
    pub create: bool,
    /// Cache budget in bytes.
    pub cache_size: u64,
    /// Upper bound on concurrently open sessions.
    pub session_max: usize,
    /// Extension libraries named in `extensions=[...]`.
    pub extensions: Vec<String>,
    /// Maintain [`EngineStats`] counters.
    pub statistics: bool,
    /// Journal settings.
    pub log: LogConfig,
    /// Checkpoint triggers.
    pub checkpoint: CheckpointConfig,
    passthrough: Vec<String>,
}

impl Default for OpenConfig {
    fn default() -> Self {
        Self {
            create: false,
            cache_size: 100 << 20,
            session_max: 100,
            extensions: Vec::new(),
            statistics: false,
            log: LogConfig::default(),
            checkpoint: CheckpointConfig::default(),
            passthrough: Vec::new(),
        }
    }
}

impl OpenConfig {
    /// Parses an open configuration string. Unknown items never fail the parse.
    pub fn parse(text: &str) -> EngineResult<Self> {
        let mut cfg = OpenConfig::default();
        for item in parse_config(text)? {
            match item.key.as_str() {
                "create" => cfg.create = parse_bool(&item)?,
                "cache_size" => {
                    let raw = item.scalar().ok_or_else(|| {
                        EngineError::Invalid("'cache_size' expects a size".into())
                    })?;
                    cfg.cache_size = parse_size(raw)?;
                }
                "session_max" => cfg.session_max = parse_u64(&item)? as usize,
                "extensions" => {
                    cfg.extensions = item
                        .group()
                        .iter()
                        .map(|ext| {
                            ext.group()
                                .iter()
                                .find(|e| e.key == "entry")
                                .and_then(|e| e.scalar())
                                .unwrap_or(ext.key.as_str())
                                .to_string()
                        })
                        .collect();
                }
                "statistics" => {
                    cfg.statistics = match &item.value {
                        ConfigValue::Flag => true,
                        ConfigValue::Scalar(s) => s != "none" && s != "false",
                        ConfigValue::Group(items) | ConfigValue::List(items) => {
                            items.iter().any(|i| i.key != "none")
                        }
                    };
                }
                "log" => {
                    for sub in item.group() {
                        match sub.key.as_str() {
                            "enabled" => cfg.log.enabled = parse_bool(sub)?,
                            "archive" => cfg.log.archive = parse_bool(sub)?,
                            "path" => {
                                cfg.log.path = sub.scalar().unwrap_or("journal").to_string()
                            }
                            _ => cfg.passthrough.push(format!("log.{}", sub.raw)),
                        }
                    }
                }
                "checkpoint" => {
                    for sub in item.group() {
                        match sub.key.as_str() {
                            "wait" => cfg.checkpoint.wait_secs = parse_u64(sub)?,
                            "log_size" => {
                                cfg.checkpoint.log_size =
                                    parse_size(sub.scalar().unwrap_or("0"))?
                            }
                            _ => cfg.passthrough.push(format!("checkpoint.{}", sub.raw)),
                        }
                    }
                }
                _ => cfg.passthrough.push(item.raw),
            }
        }
        Ok(cfg)
    }

    /// Items the engine did not recognise, in their original order and spelling.
    pub fn passthrough(&self) -> &[String] {
        &self.passthrough
    }
}

/// Settings accepted by `Session::begin_transaction`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TxnConfig {
    /// Wait for the journal to reach disk before commit returns.
    pub sync: bool,
}

impl TxnConfig {
    /// Parses a `begin_transaction` configuration string.
    pub fn parse(text: &str) -> EngineResult<Self> {
        let mut cfg = TxnConfig::default();
        for item in parse_config(text)? {
            if item.key == "sync" {
                cfg.sync = parse_bool(&item)?;
            }
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_open_string_parses() {
        let cfg = OpenConfig::parse(
            "create,cache_size=3G,session_max=20000,\
             extensions=[local=(entry=index_collator_extension)],statistics=(all),\
             log=(enabled=true,archive=true,path=journal),\
             checkpoint=(wait=60,log_size=2GB),eviction_trigger=95,verbose=[recovery]",
        )
        .unwrap();
        assert!(cfg.create);
        assert_eq!(cfg.cache_size, 3 << 30);
        assert_eq!(cfg.session_max, 20000);
        assert_eq!(cfg.extensions, vec!["index_collator_extension".to_string()]);
        assert!(cfg.statistics);
        assert!(cfg.log.enabled && cfg.log.archive);
        assert_eq!(cfg.log.path, "journal");
        assert_eq!(cfg.checkpoint.wait_secs, 60);
        assert_eq!(cfg.checkpoint.log_size, 2 << 30);
        assert_eq!(
            cfg.passthrough(),
            &["eviction_trigger=95".to_string(), "verbose=[recovery]".to_string()]
        );
    }

    #[test]
    fn malformed_groups_are_rejected() {
        assert!(parse_config("log=(enabled=true").is_err());
        assert!(parse_config("log=enabled=true)").is_err());
        assert!(parse_config("=5").is_err());
    }

    #[test]
    fn sizes_accept_suffixes() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("1k").unwrap(), 1024);
        assert_eq!(parse_size("512MB").unwrap(), 512 << 20);
        assert!(parse_size("12Q").is_err());
    }

    #[test]
    fn txn_config_reads_sync() {
        assert!(TxnConfig::parse("sync=true").unwrap().sync);
        assert!(!TxnConfig::parse("").unwrap().sync);
        assert!(!TxnConfig::parse("isolation=snapshot").unwrap().sync);
    }
}
