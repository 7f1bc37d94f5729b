use std::{fmt, str::FromStr};

/// A cluster operation id: four dash-separated hex groups of up to eight
/// digits each, e.g. `1a2b3c4d-5e6f7890-12345678-9abcdef0`.
///
/// Operation ids travel as opaque strings through discovery; the
/// authorization path parses them back into this form before asking the
/// cluster for a permission check.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OperationId(String);

impl OperationId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid operation id {0:?}")]
pub struct InvalidOperationId(pub String);

impl FromStr for OperationId {
    type Err = InvalidOperationId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut groups = 0;
        for group in s.split('-') {
            groups += 1;
            if groups > 4
                || group.is_empty()
                || group.len() > 8
                || !group.bytes().all(|b| b.is_ascii_hexdigit())
            {
                return Err(InvalidOperationId(s.to_string()));
            }
        }
        if groups != 4 {
            return Err(InvalidOperationId(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_guids() {
        for ok in ["1a2b3c4d-5e6f7890-12345678-9abcdef0", "1-2-3-4", "abc-DEF-0-12345678"] {
            assert_eq!(ok.parse::<OperationId>().unwrap().as_str(), ok);
        }
    }

    #[test]
    fn rejects_non_guids() {
        for bad in [
            "",
            "op1",
            "1-2-3",
            "1-2-3-4-5",
            "1--3-4",
            "123456789-2-3-4",
            "xyz-2-3-4",
            "1-2-3-4 ",
        ] {
            assert!(bad.parse::<OperationId>().is_err(), "{bad:?}");
        }
    }
}
