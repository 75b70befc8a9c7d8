//! Per-country bridge block and allow lists.

use rdsys_api::{LocationSet, RdError, RdResult};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// The combination of a block list and an allow list.
///
/// A country blocks a bridge if the bridge is on the country's block
/// list and not on its allow list. Additionally, the allow list is
/// exhaustive: if an allow list exists for a country, every bridge not
/// explicitly allowed there counts as blocked in that country.
#[derive(Debug, Default)]
pub struct BlockList {
    /// fingerprint -> blocking countries.
    blocked: HashMap<String, LocationSet>,

    /// country -> allowed fingerprints.
    allowed: HashMap<String, HashSet<String>>,
}

impl BlockList {
    /// Load the block and allow lists from the given files. A missing
    /// path stands for an empty list.
    pub fn load(
        block_file: Option<&Path>,
        allow_file: Option<&Path>,
    ) -> RdResult<Self> {
        let mut bl = BlockList::default();

        for (fingerprint, country) in parse_block_allow_list(block_file)? {
            bl.blocked
                .entry(fingerprint)
                .or_default()
                .insert(country);
        }
        for (fingerprint, country) in parse_block_allow_list(allow_file)? {
            bl.allowed
                .entry(country)
                .or_default()
                .insert(fingerprint);
        }
        Ok(bl)
    }

    /// The set of countries the given bridge is blocked in.
    pub fn blocked_in(&self, fingerprint: &str) -> LocationSet {
        let mut blocked = self
            .blocked
            .get(fingerprint)
            .cloned()
            .unwrap_or_default();

        for (country, fingerprints) in &self.allowed {
            if fingerprints.contains(fingerprint) {
                blocked.remove(country);
            } else {
                blocked.insert(country.clone());
            }
        }
        blocked
    }
}

/// Parse a list of `fingerprint <FP> country-code <cc>` lines.
fn parse_block_allow_list(
    path: Option<&Path>,
) -> RdResult<Vec<(String, String)>> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    let content =
        std::fs::read_to_string(path).map_err(RdError::persistence)?;

    let mut list = Vec::new();
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 4
            || fields[0] != "fingerprint"
            || fields[2] != "country-code"
        {
            tracing::warn!(
                "Wrong blocklist format ({}): {line}",
                path.display(),
            );
            continue;
        }
        list.push((fields[1].to_string(), fields[3].to_string()));
    }
    Ok(list)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    fn write_list(lines: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(lines.as_bytes()).unwrap();
        file
    }

    const FP1: &str = "00112233445566778899AABBCCDDEEFF00112233";
    const FP2: &str = "FFEEDDCCBBAA99887766554433221100FFEEDDCC";

    #[test]
    fn blocked_without_allow_list() {
        let block = write_list(&format!(
            "fingerprint {FP1} country-code ru\n\
             fingerprint {FP1} country-code cn\n\
             garbage line\n",
        ));
        let bl = BlockList::load(Some(block.path()), None).unwrap();

        let blocked = bl.blocked_in(FP1);
        assert!(blocked.contains("ru") && blocked.contains("cn"));
        assert!(bl.blocked_in(FP2).is_empty());
    }

    #[test]
    fn allow_list_is_exhaustive_per_country() {
        let block = write_list(&format!(
            "fingerprint {FP1} country-code ru\n",
        ));
        let allow = write_list(&format!(
            "fingerprint {FP1} country-code ru\n",
        ));
        let bl =
            BlockList::load(Some(block.path()), Some(allow.path())).unwrap();

        // FP1 is blocked in ru but also allowed there: not blocked.
        assert!(!bl.blocked_in(FP1).contains("ru"));

        // FP2 is not on ru's allow list, so it is blocked in ru even
        // though it never appeared on the block list.
        assert!(bl.blocked_in(FP2).contains("ru"));
    }

    #[test]
    fn missing_files_mean_empty_lists() {
        let bl = BlockList::load(None, None).unwrap();
        assert!(bl.blocked_in(FP1).is_empty());
    }
}
