//! Node-selector expressions
//!
//! Grammar: comma-separated tokens applied left to right. A token is a
//! number (`3`), an inclusive range (`5-7`), or either of those prefixed with
//! `-` to remove values added by earlier tokens (`-6`, `-2-3`). `ALL` or an
//! empty string select every node.

use crate::error::{FleetError, Result};
use crate::model::{GroupId, NodeNo};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

const MAX_RANGE_SPAN: u32 = 65_536;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NodeSelector {
    #[default]
    All,
    /// Ascending and de-duplicated
    List(Vec<NodeNo>),
}

impl NodeSelector {
    pub fn parse(expr: &str) -> Result<Self> {
        Ok(match parse_number_list(expr)? {
            None => NodeSelector::All,
            Some(list) => NodeSelector::List(list),
        })
    }

    pub fn single(node: NodeNo) -> Self {
        NodeSelector::List(vec![node])
    }

    pub fn is_all(&self) -> bool {
        matches!(self, NodeSelector::All)
    }

    /// Resolves against the nodes that exist. Every explicitly listed node
    /// must be present.
    pub fn resolve(&self, group: &GroupId, available: &[NodeNo]) -> Result<Vec<NodeNo>> {
        let available: BTreeSet<NodeNo> = available.iter().copied().collect();
        match self {
            NodeSelector::All => Ok(available.into_iter().collect()),
            NodeSelector::List(list) => {
                if let Some(missing) = list.iter().find(|n| !available.contains(n)) {
                    return Err(FleetError::not_found(
                        "node",
                        format!("{} node {}", group, missing),
                    ));
                }
                Ok(list.clone())
            }
        }
    }

    /// Like [`NodeSelector::resolve`], but silently drops nodes that do not exist
    pub fn resolve_existing(&self, available: &[NodeNo]) -> Vec<NodeNo> {
        let available: BTreeSet<NodeNo> = available.iter().copied().collect();
        match self {
            NodeSelector::All => available.into_iter().collect(),
            NodeSelector::List(list) => list
                .iter()
                .copied()
                .filter(|n| available.contains(n))
                .collect(),
        }
    }
}

impl FromStr for NodeSelector {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self> {
        NodeSelector::parse(s)
    }
}

impl fmt::Display for NodeSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeSelector::All => f.write_str("ALL"),
            NodeSelector::List(list) => {
                let parts: Vec<String> = list.iter().map(|n| n.to_string()).collect();
                f.write_str(&parts.join(","))
            }
        }
    }
}

/// Parses a number-list expression. `None` means "no filtering".
///
/// Shared by node selectors and the disk and partition filters of the CLI.
pub fn parse_number_list(expr: &str) -> Result<Option<Vec<u32>>> {
    let expr = expr.trim();
    if expr.is_empty() || expr.eq_ignore_ascii_case("all") {
        return Ok(None);
    }

    let mut selected = BTreeSet::new();
    for raw in expr.split(',') {
        let token = raw.trim();
        let (remove, body) = match token.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, token),
        };
        let (start, end) = parse_range(body, token)?;
        for n in start..=end {
            if remove {
                selected.remove(&n);
            } else {
                selected.insert(n);
            }
        }
    }

    Ok(Some(selected.into_iter().collect()))
}

fn parse_range(body: &str, token: &str) -> Result<(u32, u32)> {
    let invalid = |reason: &str| {
        FleetError::validation(format!("invalid node selector token '{}': {}", token, reason))
    };
    let number = |s: &str| -> Result<u32> {
        let s = s.trim();
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("expected a positive number"));
        }
        let n: u32 = s.parse().map_err(|_| invalid("number out of range"))?;
        if n == 0 {
            return Err(invalid("node numbers start at 1"));
        }
        Ok(n)
    };

    match body.split_once('-') {
        None => {
            let n = number(body)?;
            Ok((n, n))
        }
        Some((start, end)) => {
            let start = number(start)?;
            let end = number(end)?;
            if end < start {
                return Err(invalid("range end is before its start"));
            }
            if end - start >= MAX_RANGE_SPAN {
                return Err(invalid("range is too large"));
            }
            Ok((start, end))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GroupName;

    fn list(expr: &str) -> Vec<NodeNo> {
        match NodeSelector::parse(expr).unwrap() {
            NodeSelector::List(list) => list,
            NodeSelector::All => panic!("expected a list for {expr}"),
        }
    }

    #[test]
    fn test_numbers_and_ranges() {
        assert_eq!(list("1,3,5-7"), vec![1, 3, 5, 6, 7]);
        assert_eq!(list("3,1,3"), vec![1, 3]);
        assert_eq!(list(" 2 , 4-4 "), vec![2, 4]);
    }

    #[test]
    fn test_removal_tokens() {
        assert_eq!(list("5-7,-6"), vec![5, 7]);
        assert_eq!(list("1-10,-2-9"), vec![1, 10]);
        assert_eq!(list("1,-4"), vec![1]);
        assert_eq!(list("-1"), Vec::<NodeNo>::new());
    }

    #[test]
    fn test_all_forms() {
        assert_eq!(NodeSelector::parse("ALL").unwrap(), NodeSelector::All);
        assert_eq!(NodeSelector::parse("all").unwrap(), NodeSelector::All);
        assert_eq!(NodeSelector::parse("").unwrap(), NodeSelector::All);
    }

    #[test]
    fn test_malformed_tokens() {
        for bad in ["a-b", "a", "0", "0-3", "7-5", "3--1", "1,,2", "1-", "-", "1.5"] {
            let err = NodeSelector::parse(bad).unwrap_err();
            assert!(err.is_validation(), "{bad}: {err}");
        }
    }

    #[test]
    fn test_resolve() {
        let group = GroupId::cluster(GroupName::new("mydc").unwrap());
        let available = vec![3, 1, 2];
        assert_eq!(
            NodeSelector::All.resolve(&group, &available).unwrap(),
            vec![1, 2, 3]
        );
        assert_eq!(
            NodeSelector::parse("2-3").unwrap().resolve(&group, &available).unwrap(),
            vec![2, 3]
        );
        let err = NodeSelector::parse("2,5").unwrap().resolve(&group, &available).unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(
            NodeSelector::parse("2,5").unwrap().resolve_existing(&available),
            vec![2]
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(NodeSelector::parse("3,1").unwrap().to_string(), "1,3");
        assert_eq!(NodeSelector::All.to_string(), "ALL");
    }
}
