//! Value/source pair shared by the pool and dataset property namespaces.
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};

/// Where a property value comes from. Mirrors `zprop_source_t`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertySource {
    None,
    Default,
    Temporary,
    Local,
    /// Inherited. Carries the name of the dataset it comes from when known.
    Inherited(String),
    Received,
}

impl PropertySource {
    pub const ZPROP_SRC_NONE: u32 = 0x1;
    pub const ZPROP_SRC_DEFAULT: u32 = 0x2;
    pub const ZPROP_SRC_TEMPORARY: u32 = 0x4;
    pub const ZPROP_SRC_LOCAL: u32 = 0x8;
    pub const ZPROP_SRC_INHERITED: u32 = 0x10;
    pub const ZPROP_SRC_RECEIVED: u32 = 0x20;

    /// Translate `zprop_source_t` plus the "inherited from" buffer libzfs fills in.
    pub fn from_native(source: u32, inherited_from: &str) -> Self {
        match source {
            Self::ZPROP_SRC_DEFAULT => PropertySource::Default,
            Self::ZPROP_SRC_TEMPORARY => PropertySource::Temporary,
            Self::ZPROP_SRC_LOCAL => PropertySource::Local,
            Self::ZPROP_SRC_INHERITED => PropertySource::Inherited(inherited_from.to_string()),
            Self::ZPROP_SRC_RECEIVED => PropertySource::Received,
            _ => PropertySource::None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            PropertySource::None => "none",
            PropertySource::Default => "default",
            PropertySource::Temporary => "temporary",
            PropertySource::Local => "local",
            PropertySource::Inherited(from) if !from.is_empty() => from,
            PropertySource::Inherited(_) => "inherited",
            PropertySource::Received => "received",
        }
    }
}

impl fmt::Display for PropertySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Property value as libzfs renders it. Numbers are strings too.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[get = "pub"]
pub struct Property {
    value: String,
    source: PropertySource,
}

impl Property {
    pub fn new<V: Into<String>>(value: V, source: PropertySource) -> Self {
        Property { value: value.into(), source }
    }

    /// What libzfs reports for a property that is not set at all.
    pub fn absent() -> Self { Property::new("-", PropertySource::None) }

    /// Parse value as a number. Ratios like `1.50x` are not numbers.
    pub fn as_u64(&self) -> Option<u64> { self.value.parse().ok() }

    /// Interpret value as seconds since epoch (`creation` property).
    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        let secs: i64 = self.value.parse().ok()?;
        Utc.timestamp_opt(secs, 0).single()
    }

    pub fn is_on(&self) -> bool { self.value == "on" }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn source_from_native() {
        assert_eq!(PropertySource::Local, PropertySource::from_native(0x8, ""));
        assert_eq!(
            PropertySource::Inherited("tank".into()),
            PropertySource::from_native(0x10, "tank")
        );
        assert_eq!(PropertySource::None, PropertySource::from_native(0, ""));
        assert_eq!("tank", PropertySource::Inherited("tank".into()).to_string());
        assert_eq!("inherited", PropertySource::Inherited(String::new()).to_string());
    }

    #[test]
    fn creation_as_datetime() {
        let prop = Property::new("1500000000", PropertySource::None);
        assert_eq!(1_500_000_000, prop.as_datetime().unwrap().timestamp());
        assert_eq!(None, Property::absent().as_datetime());
        assert_eq!(Some(1_500_000_000), prop.as_u64());
    }
}
