//! `key=value;key=value` parameter strings.

use std::fmt;

/// Key selecting the device mask of a stream.
pub const ROUTING: &str = "routing";

/// Key selecting the capture source of an input stream.
pub const INPUT_SOURCE: &str = "input_source";

/// Number of defined capture sources; valid sources are `1..INPUT_SOURCE_COUNT`.
pub const INPUT_SOURCE_COUNT: u32 = 10;

/// Ordered list of parameters parsed from, or rendered to, a
/// `key=value;key=value` string.
///
/// ```
/// use pcm_router::ParamList;
///
/// let params = ParamList::parse("routing=2;input_source=1");
/// assert_eq!(params.get_u32("routing"), Some(2));
/// assert_eq!(params.to_string(), "routing=2;input_source=1");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamList {
    pairs: Vec<(String, String)>,
}

impl ParamList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `s`. Empty segments are skipped; a segment without `=` is a
    /// key with an empty value. Later duplicates replace earlier ones.
    pub fn parse(s: &str) -> Self {
        let mut list = Self::new();
        for segment in s.split(';').map(str::trim).filter(|seg| !seg.is_empty()) {
            let (key, value) = segment.split_once('=').unwrap_or((segment, ""));
            list.set(key.trim(), value.trim());
        }
        list
    }

    /// Sets `key` to `value`, keeping its original position if present.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.pairs.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value,
            None => self.pairs.push((key.to_string(), value)),
        }
    }

    /// Raw value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Value of `key` as an unsigned integer, decimal or `0x` hex.
    ///
    /// A value that does not parse is logged and treated as absent.
    pub fn get_u32(&self, key: &str) -> Option<u32> {
        let raw = self.get(key)?;
        let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16),
            None => raw.parse(),
        };
        match parsed {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(key, value = raw, "ignoring non-numeric parameter");
                None
            }
        }
    }

    /// Keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|(k, _)| k.as_str())
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether the list holds no parameters.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl fmt::Display for ParamList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.pairs.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

/// Whether `source` names a real capture source. Source 0 is the default
/// placeholder and never selected explicitly.
pub fn is_valid_input_source(source: u32) -> bool {
    source != 0 && source < INPUT_SOURCE_COUNT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_render() {
        let params = ParamList::parse(" routing=8 ; input_source=6;;flag");
        assert_eq!(params.len(), 3);
        assert_eq!(params.get(ROUTING), Some("8"));
        assert_eq!(params.get("flag"), Some(""));
        assert_eq!(params.to_string(), "routing=8;input_source=6;flag=");
    }

    #[test]
    fn test_numeric_values() {
        let params = ParamList::parse("routing=0x80000004;input_source=abc");
        assert_eq!(params.get_u32(ROUTING), Some(0x8000_0004));
        assert_eq!(params.get_u32(INPUT_SOURCE), None);
        assert_eq!(params.get_u32("missing"), None);
    }

    #[test]
    fn test_set_replaces_in_place() {
        let mut params = ParamList::parse("a=1;b=2");
        params.set("a", "3");
        params.set("c", "4");
        assert_eq!(params.to_string(), "a=3;b=2;c=4");
    }

    #[test]
    fn test_input_source_range() {
        assert!(!is_valid_input_source(0));
        assert!(is_valid_input_source(1));
        assert!(is_valid_input_source(9));
        assert!(!is_valid_input_source(10));
    }

    #[test]
    fn test_empty() {
        assert!(ParamList::parse("").is_empty());
        assert_eq!(ParamList::new().to_string(), "");
    }
}
