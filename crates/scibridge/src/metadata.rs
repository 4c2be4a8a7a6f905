//! Ordered string dictionary holding the worker's image metadata.

use std::str::FromStr;

use indexmap::IndexMap;
use serde::Serialize;

use crate::error::MetadataError;

/// Types that can be read out of a metadata value.
pub trait FromMetadata: Sized {
    /// Name used in parse errors.
    const EXPECTED: &'static str;

    fn from_metadata(value: &str) -> Option<Self>;
}

macro_rules! from_metadata_via_from_str {
    ($($ty:ty),* $(,)?) => {
        $(
            impl FromMetadata for $ty {
                const EXPECTED: &'static str = stringify!($ty);

                fn from_metadata(value: &str) -> Option<Self> {
                    <$ty as FromStr>::from_str(value.trim()).ok()
                }
            }
        )*
    };
}

from_metadata_via_from_str!(i8, i16, i32, i64, u8, u16, u32, u64, usize, f32, f64);

impl FromMetadata for bool {
    const EXPECTED: &'static str = "boolean";

    fn from_metadata(value: &str) -> Option<Self> {
        parse_bool(value)
    }
}

impl FromMetadata for String {
    const EXPECTED: &'static str = "string";

    fn from_metadata(value: &str) -> Option<Self> {
        Some(value.to_string())
    }
}

/// `true`/`false` in any case, or an integer where zero is false.
pub fn parse_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("true") {
        Some(true)
    } else if value.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        value.parse::<i64>().ok().map(|n| n != 0)
    }
}

/// Insertion-ordered mapping where the first write to a key wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct MetadataDictionary {
    entries: IndexMap<String, String>,
}

impl MetadataDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `value` unless `key` is already present. Returns whether it was stored.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        let value = value.into();
        if let Some(existing) = self.entries.get(&key) {
            tracing::debug!(
                %key,
                ignored = %value,
                kept = %existing,
                "Metadata key already defined; keeping first value"
            );
            return false;
        }
        self.entries.insert(key, value);
        true
    }

    pub fn get<T: FromMetadata>(&self, key: &str) -> Result<T, MetadataError> {
        let raw = self
            .entries
            .get(key)
            .ok_or_else(|| MetadataError::MissingKey(key.to_string()))?;
        T::from_metadata(raw).ok_or_else(|| MetadataError::Parse {
            key: key.to_string(),
            value: raw.clone(),
            expected: T::EXPECTED,
        })
    }

    /// Like [`get`](Self::get) but an absent key yields `None`.
    pub fn get_opt<T: FromMetadata>(&self, key: &str) -> Result<Option<T>, MetadataError> {
        if self.has_key(key) {
            self.get(key).map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_write_wins() {
        let mut dict = MetadataDictionary::new();
        assert!(dict.put("SizeX", "100"));
        assert!(!dict.put("SizeX", "200"));
        assert!(!dict.put("SizeX", "300"));

        assert_eq!(dict.get::<u64>("SizeX").unwrap(), 100);
        assert_eq!(dict.len(), 1);
    }

    #[test]
    fn preserves_insertion_order() {
        let mut dict = MetadataDictionary::new();
        dict.put("b", "1");
        dict.put("a", "2");
        dict.put("c", "3");
        dict.put("a", "4");

        let keys: Vec<_> = dict.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["b", "a", "c"]);
    }

    #[test]
    fn missing_key() {
        let dict = MetadataDictionary::new();
        assert_eq!(
            dict.get::<i64>("PixelType"),
            Err(MetadataError::MissingKey("PixelType".to_string()))
        );
        assert_eq!(dict.get_opt::<bool>("UseLUT"), Ok(None));
    }

    #[test]
    fn parse_error_reports_value_and_type() {
        let mut dict = MetadataDictionary::new();
        dict.put("PixelsPhysicalSizeX", "one micron");

        assert_eq!(
            dict.get::<f64>("PixelsPhysicalSizeX"),
            Err(MetadataError::Parse {
                key: "PixelsPhysicalSizeX".to_string(),
                value: "one micron".to_string(),
                expected: "f64",
            })
        );
    }

    #[test]
    fn booleans_accept_words_and_integers() {
        let mut dict = MetadataDictionary::new();
        dict.put("a", "TRUE");
        dict.put("b", "false");
        dict.put("c", "0");
        dict.put("d", "-3");
        dict.put("e", "yes");

        assert!(dict.get::<bool>("a").unwrap());
        assert!(!dict.get::<bool>("b").unwrap());
        assert!(!dict.get::<bool>("c").unwrap());
        assert!(dict.get::<bool>("d").unwrap());
        assert!(dict.get::<bool>("e").is_err());
    }

    #[test]
    fn strings_returned_verbatim() {
        let mut dict = MetadataDictionary::new();
        dict.put("Description", " two\nlines ");
        assert_eq!(dict.get::<String>("Description").unwrap(), " two\nlines ");
        assert_eq!(dict.get_str("Description"), Some(" two\nlines "));
    }

    #[test]
    fn serializes_as_ordered_object() {
        let mut dict = MetadataDictionary::new();
        dict.put("SizeY", "50");
        dict.put("SizeX", "100");
        assert_eq!(
            serde_json::to_string(&dict).unwrap(),
            r#"{"SizeY":"50","SizeX":"100"}"#
        );
    }
}
