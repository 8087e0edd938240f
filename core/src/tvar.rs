//! Structured-reasoning block extraction.
//!
//! Agents are prompted to think in `<thought>` / `<verify>` /
//! `<action>` / `<result>` blocks. A block starts with a thought
//! immediately followed (modulo whitespace) by a verify; action and result
//! are optional tails. Tags are case-insensitive. A thought with no verify
//! after it is not a block and is left alone.

use std::ops::Range;
use std::sync::LazyLock;

use regex_lite::Regex;

use redcell_protocol::protocol::Phase;

#[allow(clippy::expect_used)]
static BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)<thought>(.*?)</thought>\s*<verify>(.*?)</verify>(?:\s*<action>(.*?)</action>)?(?:\s*<result>(.*?)</result>)?",
    )
    .expect("tvar block regex")
});

/// One parsed block plus the byte range it occupied in the source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TvarBlock {
    pub thought: String,
    pub verify: String,
    pub action: Option<String>,
    pub result: Option<String>,
    pub phase: Option<Phase>,
    pub range: Range<usize>,
}

/// Extract every block of `text`, in order of appearance.
pub fn parse(text: &str) -> Vec<TvarBlock> {
    BLOCK_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let all = caps.get(0)?;
            let thought = caps.get(1)?.as_str().trim().to_string();
            let verify = caps.get(2)?.as_str().trim().to_string();
            let action = caps.get(3).map(|m| m.as_str().trim().to_string());
            let result = caps.get(4).map(|m| m.as_str().trim().to_string());
            let phase = classify_phase(&format!("{thought} {verify}"));
            Some(TvarBlock {
                thought,
                verify,
                action,
                result,
                phase,
                range: all.start()..all.end(),
            })
        })
        .collect()
}

/// Remove the parsed ranges from `text`, highest index first so earlier
/// ranges stay valid while later ones are cut.
pub fn strip(text: &str, blocks: &[TvarBlock]) -> String {
    let mut out = text.to_string();
    let mut ranges: Vec<&Range<usize>> = blocks.iter().map(|b| &b.range).collect();
    ranges.sort_by_key(|r| std::cmp::Reverse(r.start));
    for range in ranges {
        if range.end <= out.len() {
            out.replace_range(range.clone(), "");
        }
    }
    out
}

const RECONNAISSANCE: &[&str] = &[
    "recon",
    "scan",
    "sweep",
    "discover",
    "fingerprint",
    "osint",
    "nmap",
    "host is up",
];

const ENUMERATION: &[&str] = &[
    "enumerat",
    "banner",
    "share",
    "directory listing",
    "smb",
    "ldap",
    "kerberos",
    "service version",
    "list users",
];

const EXPLOITATION: &[&str] = &[
    "exploit",
    "payload",
    "injection",
    "overflow",
    "cve-",
    "reverse shell",
    "rce",
    "sqli",
    "metasploit",
];

const POST_EXPLOITATION: &[&str] = &[
    "privilege escalation",
    "privesc",
    "persistence",
    "lateral",
    "pivot",
    "exfiltrat",
    "loot",
    "dump hash",
    "mimikatz",
];

const REPORTING: &[&str] = &[
    "report",
    "summary",
    "write-up",
    "writeup",
    "findings",
    "remediat",
    "document the",
];

/// First vocabulary with a hit wins; no hit means no phase.
pub fn classify_phase(text: &str) -> Option<Phase> {
    let lower = text.to_lowercase();
    let vocabularies = [
        (Phase::Reconnaissance, RECONNAISSANCE),
        (Phase::Enumeration, ENUMERATION),
        (Phase::Exploitation, EXPLOITATION),
        (Phase::PostExploitation, POST_EXPLOITATION),
        (Phase::Reporting, REPORTING),
    ];
    vocabularies
        .into_iter()
        .find(|(_, words)| words.iter().any(|word| lower.contains(word)))
        .map(|(phase, _)| phase)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_two_blocks_and_strips_them() {
        let text = "pre<thought>A</thought><verify>B</verify>mid<thought>C</thought><verify>D</verify>post";
        let blocks = parse(text);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].thought, "A");
        assert_eq!(blocks[0].verify, "B");
        assert_eq!(blocks[1].thought, "C");
        assert_eq!(blocks[1].verify, "D");
        assert_eq!(blocks[0].phase, None);

        let stripped = strip(text, &blocks);
        assert_eq!(stripped, "premidpost");
        assert!(parse(&stripped).is_empty());
    }

    #[test]
    fn thought_without_verify_is_ignored() {
        let text = "<thought>orphaned</thought> and nothing else";
        assert!(parse(text).is_empty());
    }

    #[test]
    fn tags_are_case_insensitive_and_whitespace_tolerant() {
        let text = "<THOUGHT>scan the subnet</THOUGHT>\n  <Verify>nmap is installed</Verify>\n<action>nmap -sV 10.0.0.0/24</action>";
        let blocks = parse(text);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].thought, "scan the subnet");
        assert_eq!(blocks[0].action.as_deref(), Some("nmap -sV 10.0.0.0/24"));
        assert_eq!(blocks[0].result, None);
        assert_eq!(blocks[0].phase, Some(Phase::Reconnaissance));
    }

    #[test]
    fn optional_result_is_captured() {
        let text = "<thought>t</thought><verify>v</verify><action>a</action><result>r</result>";
        let blocks = parse(text);
        assert_eq!(blocks[0].result.as_deref(), Some("r"));
        assert_eq!(strip(text, &blocks), "");
    }

    #[test]
    fn phase_first_match_wins() {
        assert_eq!(
            classify_phase("enumerate the smb shares we scanned"),
            Some(Phase::Reconnaissance)
        );
        assert_eq!(
            classify_phase("dump hashes then pivot"),
            Some(Phase::PostExploitation)
        );
        assert_eq!(classify_phase("write the findings report"), Some(Phase::Reporting));
        assert_eq!(classify_phase("nothing interesting here"), None);
    }
}
