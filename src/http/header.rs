use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Case-insensitive multi-valued HTTP headers.
///
/// Names are stored in canonical form (first letter and letters following a
/// `-` uppercased, the rest lowercased). Serialization emits names in
/// ascending order, one `Name: value` line per value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: BTreeMap<String, Vec<String>>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the first value for the given name, or the empty string.
    pub fn get(&self, name: &str) -> &str {
        self.entries
            .get(&canonical_name(name))
            .and_then(|values| values.first())
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Returns all values for the given name in insertion order.
    pub fn values(&self, name: &str) -> &[String] {
        self.entries
            .get(&canonical_name(name))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Replaces all values for the given name.
    pub fn set(&mut self, name: &str, value: &str) {
        self.entries
            .insert(canonical_name(name), vec![value.to_string()]);
    }

    /// Appends a value for the given name.
    pub fn add(&mut self, name: &str, value: &str) {
        self.entries
            .entry(canonical_name(name))
            .or_default()
            .push(value.to_string());
    }

    /// Removes all values for the given name.
    pub fn remove(&mut self, name: &str) {
        self.entries.remove(&canonical_name(name));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    /// Serializes the headers into `buf`, names ascending, one line per value.
    pub fn write_to(&self, buf: &mut String) {
        for (name, values) in &self.entries {
            for value in values {
                let _ = write!(buf, "{name}: {value}\r\n");
            }
        }
    }
}

/// Canonicalizes a header name: `content-length` becomes `Content-Length`.
/// Idempotent.
pub(crate) fn canonical_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.extend(c.to_uppercase());
        } else {
            out.extend(c.to_lowercase());
        }
        upper = c == '-';
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_first_value() {
        let mut headers = Headers::new();
        headers.add("Host", "test-host");
        headers.add("Host", "other");
        assert_eq!(headers.get("Host"), "test-host");
    }

    #[test]
    fn get_canonicalizes_the_name() {
        let mut headers = Headers::new();
        headers.set("Host", "test-host");
        assert_eq!(headers.get("host"), "test-host");
        assert_eq!(headers.get("HOST"), "test-host");
    }

    #[test]
    fn get_missing_returns_empty() {
        let headers = Headers::new();
        assert_eq!(headers.get("Something"), "");
    }

    #[test]
    fn set_replaces_all_values() {
        let mut headers = Headers::new();
        headers.add("foo", "a");
        headers.add("foo", "b");
        headers.set("foo", "bar");
        assert_eq!(headers.values("Foo"), ["bar"]);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut headers = Headers::new();
        headers.set("Foo", "bar");
        headers.remove("foo");
        headers.remove("foo");
        headers.remove("Test");
        assert!(headers.is_empty());
    }

    #[test]
    fn write_emits_sorted_names() {
        let mut headers = Headers::new();
        headers.set("Host", "something");
        headers.add("Other", "foo");
        headers.add("Other", "bar");
        headers.set("Connection", "close");

        let mut buf = String::new();
        headers.write_to(&mut buf);
        assert_eq!(
            buf,
            "Connection: close\r\nHost: something\r\nOther: foo\r\nOther: bar\r\n"
        );
    }

    #[test]
    fn canonical_name_is_idempotent() {
        for name in ["content-length", "X-FORWARDED-FOR", "hOsT", "a-b-c"] {
            let once = canonical_name(name);
            assert_eq!(canonical_name(&once), once);
        }
        assert_eq!(canonical_name("content-length"), "Content-Length");
        assert_eq!(canonical_name("x-forwarded-for"), "X-Forwarded-For");
    }
}
