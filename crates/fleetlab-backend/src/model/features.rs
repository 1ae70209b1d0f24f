use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::ops::{BitOr, BitOrAssign};

/// Bitmask describing what role a group plays
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Features(u64);

const NAMES: [(Features, &str); 4] = [
    (Features::AEROSPIKE, "Aerospike"),
    (Features::AEROSPIKE_TOOLS, "AerospikeTools"),
    (Features::AGI, "AGI"),
    (Features::UNKNOWN, "Unknown"),
];

impl Features {
    pub const NONE: Features = Features(0);
    pub const AEROSPIKE: Features = Features(1);
    pub const AEROSPIKE_TOOLS: Features = Features(1 << 1);
    pub const AGI: Features = Features(1 << 2);
    pub const UNKNOWN: Features = Features(1 << 31);

    pub const fn from_bits(bits: u64) -> Self {
        Features(bits)
    }

    pub const fn bits(&self) -> u64 {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, other: Features) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn names(&self) -> Vec<&'static str> {
        NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }

    /// Inverse of [`Features::names`]; unrecognized names map to `UNKNOWN`.
    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        names.into_iter().fold(Features::NONE, |acc, name| {
            let flag = NAMES
                .iter()
                .find(|(_, known)| known.eq_ignore_ascii_case(name))
                .map(|(flag, _)| *flag)
                .unwrap_or(Features::UNKNOWN);
            acc | flag
        })
    }

    /// Decimal form stored in provider tags
    pub fn to_tag(&self) -> String {
        self.0.to_string()
    }

    pub fn from_tag(value: &str) -> Self {
        value
            .trim()
            .parse::<u64>()
            .map(Features)
            .unwrap_or(Features::UNKNOWN)
    }
}

impl BitOr for Features {
    type Output = Features;

    fn bitor(self, rhs: Features) -> Features {
        Features(self.0 | rhs.0)
    }
}

impl BitOrAssign for Features {
    fn bitor_assign(&mut self, rhs: Features) {
        self.0 |= rhs.0;
    }
}

impl Serialize for Features {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.names())
    }
}

impl<'de> Deserialize<'de> for Features {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        Ok(Features::from_names(names.iter().map(String::as_str)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_and_json() {
        let features = Features::AEROSPIKE | Features::AGI;
        assert_eq!(features.names(), vec!["Aerospike", "AGI"]);
        assert_eq!(
            serde_json::to_string(&features).unwrap(),
            r#"["Aerospike","AGI"]"#
        );
        let back: Features = serde_json::from_str(r#"["agi","Aerospike"]"#).unwrap();
        assert_eq!(back, features);
    }

    #[test]
    fn test_unknown_names_and_tags() {
        assert_eq!(Features::from_names(["Graph"]), Features::UNKNOWN);
        assert_eq!(Features::from_tag("5"), Features::AEROSPIKE | Features::AGI);
        assert_eq!(Features::from_tag("garbage"), Features::UNKNOWN);
        assert_eq!((Features::AEROSPIKE_TOOLS).to_tag(), "2");
        assert!(!Features::NONE.contains(Features::NONE));
    }
}
