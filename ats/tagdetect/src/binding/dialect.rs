//! Symbol tables for each dialect.
//!
//! Every logical op has a preferred export name, a declared signature and a
//! token pattern used as the last-resort scan. Patterns compare lowercase
//! `_`-separated tokens, so `apriltag_detector_detect` matches `detect` but
//! `apriltag_detections_destroy` does not.

use crate::binding::{Dialect, LogicalOp};
use crate::config::DetectorConfig;
use crate::native::{
    Signature,
    ValueKind::{Float, Handle, Int, Size, Void},
};

pub const SIG_CREATE: Signature = Signature::new(&[], Handle);
pub const SIG_RELEASE: Signature = Signature::new(&[Handle], Void);
pub const SIG_ADD_FAMILY: Signature = Signature::new(&[Handle, Handle], Void);
pub const SIG_DETECT: Signature = Signature::new(&[Handle, Handle, Int, Int], Handle);
pub const SIG_QUERY: Signature = Signature::new(&[Handle], Int);
pub const SIG_RESULT_AT: Signature = Signature::new(&[Handle, Int], Handle);
pub const SIG_CORNER: Signature = Signature::new(&[Handle, Int], Float);
pub const SIG_ALLOC: Signature = Signature::new(&[Size], Handle);
pub const SIG_INIT: Signature = Signature::new(&[], Int);
pub const SIG_SET_IMAGE: Signature = Signature::new(&[Int, Int, Int], Handle);
pub const SIG_TEARDOWN: Signature = Signature::new(&[], Void);

/// Every signature any dialect declares. Shared-library backends must be
/// able to bind each of these.
pub const ALL_SIGNATURES: &[Signature] = &[
    SIG_CREATE,
    SIG_RELEASE,
    SIG_ADD_FAMILY,
    SIG_DETECT,
    SIG_QUERY,
    SIG_RESULT_AT,
    SIG_CORNER,
    SIG_ALLOC,
    SIG_INIT,
    SIG_SET_IMAGE,
    SIG_TEARDOWN,
];

/// Token pattern for the pattern-scan lookup step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolPattern {
    /// Each keyword must match some token. A trailing `*` matches by prefix.
    pub all: &'static [&'static str],
    /// If non-empty, at least one keyword must match.
    pub any: &'static [&'static str],
    /// No keyword may match.
    pub none: &'static [&'static str],
    /// Substrings that make an export worth listing in a binding error.
    pub loose: &'static [&'static str],
}

impl SymbolPattern {
    pub fn matches(&self, export: &str) -> bool {
        let tokens = tokens(export);
        let hit = |keyword: &&str| tokens.iter().any(|t| token_matches(keyword, t));

        self.all.iter().all(hit)
            && (self.any.is_empty() || self.any.iter().any(hit))
            && !self.none.iter().any(hit)
    }

    pub fn loosely_matches(&self, export: &str) -> bool {
        let lower = export.to_ascii_lowercase();
        self.loose.iter().any(|s| lower.contains(s))
    }
}

fn tokens(export: &str) -> Vec<String> {
    export
        .to_ascii_lowercase()
        .split('_')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn token_matches(keyword: &str, token: &str) -> bool {
    match keyword.strip_suffix('*') {
        Some(prefix) => token.len() > prefix.len() && token.starts_with(prefix),
        None => token == keyword,
    }
}

/// One symbol a dialect wants bound
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolSpec {
    pub op: LogicalOp,
    /// Preferred plain export name
    pub name: String,
    pub signature: Signature,
    /// `None` disables the pattern-scan step for this symbol
    pub pattern: Option<SymbolPattern>,
    /// Optional symbols never fail resolution
    pub required: bool,
}

struct Entry {
    op: LogicalOp,
    name: &'static str,
    signature: Signature,
    pattern: SymbolPattern,
    required: bool,
}

const fn pattern(
    all: &'static [&'static str],
    any: &'static [&'static str],
    none: &'static [&'static str],
    loose: &'static [&'static str],
) -> SymbolPattern {
    SymbolPattern {
        all,
        any,
        none,
        loose,
    }
}

const CANONICAL: &[Entry] = &[
    Entry {
        op: LogicalOp::CreateDetector,
        name: "apriltag_detector_create",
        signature: SIG_CREATE,
        pattern: pattern(&["detector", "create"], &[], &["atagjs"], &["detector"]),
        required: true,
    },
    Entry {
        op: LogicalOp::AddFamily,
        name: "apriltag_detector_add_family_bits",
        signature: SIG_ADD_FAMILY,
        pattern: pattern(&["add", "family"], &[], &[], &["family"]),
        required: true,
    },
    Entry {
        op: LogicalOp::Detect,
        name: "apriltag_detector_detect",
        signature: SIG_DETECT,
        pattern: pattern(&["detect"], &[], &["atagjs"], &["detect"]),
        required: true,
    },
    Entry {
        op: LogicalOp::ResultCount,
        name: "apriltag_detections_size",
        signature: SIG_QUERY,
        pattern: pattern(&["detections", "size"], &[], &[], &["size", "count"]),
        required: true,
    },
    Entry {
        op: LogicalOp::ResultAt,
        name: "apriltag_detections_get",
        signature: SIG_RESULT_AT,
        pattern: pattern(&["detections", "get"], &[], &[], &["get"]),
        required: true,
    },
    Entry {
        op: LogicalOp::DetectionId,
        name: "apriltag_detection_id",
        signature: SIG_QUERY,
        pattern: pattern(&["detection", "id"], &[], &[], &["_id"]),
        required: true,
    },
    Entry {
        op: LogicalOp::CornerX,
        name: "apriltag_detection_px",
        signature: SIG_CORNER,
        pattern: pattern(&["detection", "px"], &[], &[], &["px", "corner"]),
        required: true,
    },
    Entry {
        op: LogicalOp::CornerY,
        name: "apriltag_detection_py",
        signature: SIG_CORNER,
        pattern: pattern(&["detection", "py"], &[], &[], &["py", "corner"]),
        required: true,
    },
    Entry {
        op: LogicalOp::DestroyResults,
        name: "apriltag_detection_list_destroy",
        signature: SIG_RELEASE,
        pattern: pattern(
            &["destroy"],
            &["list", "detections"],
            &["detector", "atagjs"],
            &["destroy"],
        ),
        required: true,
    },
    Entry {
        op: LogicalOp::Alloc,
        name: "malloc",
        signature: SIG_ALLOC,
        pattern: pattern(&["malloc"], &[], &[], &["alloc"]),
        required: true,
    },
    Entry {
        op: LogicalOp::Free,
        name: "free",
        signature: SIG_RELEASE,
        pattern: pattern(&["free"], &[], &[], &["free"]),
        required: true,
    },
    Entry {
        op: LogicalOp::DestroyDetector,
        name: "apriltag_detector_destroy",
        signature: SIG_RELEASE,
        pattern: pattern(&["detector", "destroy"], &[], &["atagjs"], &["destroy"]),
        required: false,
    },
];

const ADAPTER: &[Entry] = &[
    Entry {
        op: LogicalOp::CreateDetector,
        name: "atagjs_init",
        signature: SIG_INIT,
        pattern: pattern(&["atagjs", "init"], &[], &[], &["atagjs", "init"]),
        required: true,
    },
    Entry {
        op: LogicalOp::SetImageBuffer,
        name: "atagjs_set_img_buffer",
        signature: SIG_SET_IMAGE,
        pattern: pattern(&["atagjs", "img", "buffer"], &[], &[], &["atagjs", "buffer"]),
        required: true,
    },
    Entry {
        op: LogicalOp::Detect,
        name: "atagjs_detect",
        signature: SIG_CREATE,
        pattern: pattern(&["atagjs", "detect"], &[], &[], &["detect"]),
        required: true,
    },
    Entry {
        op: LogicalOp::DestroyDetector,
        name: "atagjs_destroy",
        signature: SIG_TEARDOWN,
        pattern: pattern(&["atagjs", "destroy"], &[], &[], &["atagjs"]),
        required: false,
    },
];

/// Pattern for any family constructor: `tag36h11_create`, `_tagStandard41h12_create`.
pub const FAMILY_CONSTRUCTOR: SymbolPattern = pattern(
    &["tag*", "create"],
    &[],
    &["detector", "atagjs"],
    &["tag"],
);

/// The symbols a dialect resolves before any native state is created, in
/// resolution order.
pub fn symbols(dialect: Dialect) -> Vec<SymbolSpec> {
    let table = match dialect {
        Dialect::Canonical => CANONICAL,
        Dialect::Adapter => ADAPTER,
    };
    table
        .iter()
        .map(|e| SymbolSpec {
            op: e.op,
            name: e.name.to_string(),
            signature: e.signature,
            pattern: Some(e.pattern),
            required: e.required,
        })
        .collect()
}

/// Constructor of one configured family. Never pattern-scanned, since a scan
/// would happily return a different family.
pub fn family_constructor(family: &str) -> SymbolSpec {
    SymbolSpec {
        op: LogicalOp::CreateFamily,
        name: format!("{family}_create"),
        signature: SIG_CREATE,
        pattern: None,
        required: true,
    }
}

pub fn family_destructor(family: &str) -> SymbolSpec {
    SymbolSpec {
        op: LogicalOp::DestroyFamily,
        name: format!("{family}_destroy"),
        signature: SIG_RELEASE,
        pattern: None,
        required: false,
    }
}

/// Recover the family identifier from a constructor export name.
pub fn family_from_export(export: &str) -> String {
    let plain = export.trim_start_matches('_');
    plain.strip_suffix("_create").unwrap_or(plain).to_string()
}

/// Every export name worth probing on a module that cannot list its own
/// exports: all dialect symbols, every configured family and any extras,
/// each in plain and `_`-prefixed form.
pub fn known_export_names(config: &DetectorConfig) -> Vec<String> {
    let mut plain: Vec<String> = CANONICAL
        .iter()
        .chain(ADAPTER.iter())
        .map(|e| e.name.to_string())
        .collect();
    for family in &config.families {
        plain.push(format!("{family}_create"));
        plain.push(format!("{family}_destroy"));
    }
    plain.extend(config.extra_exports.iter().cloned());

    let mut names: Vec<String> = plain
        .iter()
        .flat_map(|n| [n.clone(), format!("_{n}")])
        .collect();
    names.sort();
    names.dedup();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(dialect: Dialect, op: LogicalOp) -> SymbolSpec {
        symbols(dialect)
            .into_iter()
            .find(|s| s.op == op)
            .unwrap()
    }

    #[test]
    fn test_detect_pattern_is_token_based() {
        let detect = spec(Dialect::Canonical, LogicalOp::Detect).pattern.unwrap();
        assert!(detect.matches("apriltag_detector_detect"));
        assert!(detect.matches("_APRILTAG_DETECTOR_DETECT"));
        assert!(!detect.matches("apriltag_detections_destroy"));
        assert!(!detect.matches("atagjs_detect"));
    }

    #[test]
    fn test_destroy_results_pattern() {
        let destroy = spec(Dialect::Canonical, LogicalOp::DestroyResults)
            .pattern
            .unwrap();
        assert!(destroy.matches("apriltag_detections_destroy"));
        assert!(destroy.matches("_apriltag_detection_list_destroy"));
        assert!(!destroy.matches("apriltag_detector_destroy"));
    }

    #[test]
    fn test_family_constructor_pattern() {
        assert!(FAMILY_CONSTRUCTOR.matches("tag36h11_create"));
        assert!(FAMILY_CONSTRUCTOR.matches("_tagStandard41h12_create"));
        assert!(!FAMILY_CONSTRUCTOR.matches("apriltag_detector_create"));
        assert!(!FAMILY_CONSTRUCTOR.matches("tag36h11_destroy"));
    }

    #[test]
    fn test_family_from_export() {
        assert_eq!(family_from_export("_tag16h5_create"), "tag16h5");
        assert_eq!(family_from_export("tagCircle21h7_create"), "tagCircle21h7");
    }

    #[test]
    fn test_known_names_include_prefixed_variants() {
        let names = known_export_names(&DetectorConfig::default());
        assert!(names.contains(&"apriltag_detector_detect".to_string()));
        assert!(names.contains(&"_apriltag_detector_detect".to_string()));
        assert!(names.contains(&"_tag36h11_create".to_string()));
        assert!(names.contains(&"atagjs_init".to_string()));
        let mut sorted = names.clone();
        sorted.dedup();
        assert_eq!(sorted.len(), names.len());
    }

    #[test]
    fn test_every_symbol_signature_is_declared() {
        for dialect in [Dialect::Canonical, Dialect::Adapter] {
            for spec in symbols(dialect) {
                assert!(ALL_SIGNATURES.contains(&spec.signature), "{}", spec.name);
            }
        }
    }
}
