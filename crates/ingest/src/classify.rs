//! Map delivered reports to categories
//!
//! Subjects are matched first with ordered regex rules. Only when no subject
//! rule matches are file names consulted, using keyword rules over the
//! normalized file stem: the platform names files and subjects with
//! different vocabulary, so the two rule sets are independent.

use std::sync::LazyLock;

use regex::Regex;

use crate::models::Category;

struct SubjectRule {
    regex: Regex,
    category: Category,
}

struct FilenameRule {
    keywords: &'static [&'static str],
    category: Category,
}

/// Evaluated in order; first match wins. Specific phrases precede the
/// generic "new ..." and "order" rules they would otherwise shadow.
static SUBJECT_RULES: LazyLock<Vec<SubjectRule>> = LazyLock::new(|| {
    vec![
        subject(r"(?i)\bfirst[\s_-]*visits?\b", Category::FirstVisits),
        subject(r"(?i)\bfull[\s_-]*registrations?\b", Category::FullRegistrations),
        subject(r"(?i)\brevenue\b.*\bcategor(?:y|ies)\b", Category::RevenueCategories),
        subject(r"(?i)\bpaused\b.*\bsubscriptions?\b", Category::PausedSubscriptions),
        subject(r"(?i)\btrial(?:ing)?\b.*\bsubscriptions?\b", Category::TrialingSubscriptions),
        subject(
            r"(?i)\bcancell?ed\b.*\bsubscriptions?\b|\bsubscription\s+cancellations?\b",
            Category::CanceledSubscriptions,
        ),
        subject(r"(?i)\bnew\b.*\bsubscriptions?\b", Category::NewSubscriptions),
        subject(r"(?i)\bactive\b.*\bsubscriptions?\b", Category::ActiveSubscriptions),
        subject(r"(?i)\bnew\s+(?:customer|client)s?\b", Category::NewCustomers),
        subject(r"(?i)\borders?\b", Category::Orders),
    ]
});

static FILENAME_RULES: &[FilenameRule] = &[
    FilenameRule {
        keywords: &["firstvisit"],
        category: Category::FirstVisits,
    },
    FilenameRule {
        keywords: &["registration"],
        category: Category::FullRegistrations,
    },
    FilenameRule {
        keywords: &["revenue"],
        category: Category::RevenueCategories,
    },
    FilenameRule {
        keywords: &["pause"],
        category: Category::PausedSubscriptions,
    },
    FilenameRule {
        keywords: &["trial"],
        category: Category::TrialingSubscriptions,
    },
    FilenameRule {
        keywords: &["cancel"],
        category: Category::CanceledSubscriptions,
    },
    FilenameRule {
        keywords: &["newsubscri", "newmember"],
        category: Category::NewSubscriptions,
    },
    FilenameRule {
        keywords: &["subscri", "member"],
        category: Category::ActiveSubscriptions,
    },
    FilenameRule {
        keywords: &["customer", "client"],
        category: Category::NewCustomers,
    },
    FilenameRule {
        keywords: &["order", "sale"],
        category: Category::Orders,
    },
];

fn subject(pattern: &str, category: Category) -> SubjectRule {
    SubjectRule {
        regex: Regex::new(pattern).expect("Invalid subject classification pattern"),
        category,
    }
}

/// Classify a delivered file by its message subject and file name.
///
/// Subject rules take precedence over file name rules. `None` means the
/// file is unclassifiable; callers log and drop it.
pub fn classify(subject: &str, filename: &str) -> Option<Category> {
    classify_subject(subject).or_else(|| classify_filename(filename))
}

/// Match a message subject against the subject rules only
pub fn classify_subject(subject: &str) -> Option<Category> {
    SUBJECT_RULES
        .iter()
        .find(|rule| rule.regex.is_match(subject))
        .map(|rule| rule.category)
}

/// Match a file name (or archive key such as `bundle.zip/orders.csv`)
/// against the keyword rules only
pub fn classify_filename(filename: &str) -> Option<Category> {
    let stem = normalize_stem(filename);
    if stem.is_empty() {
        return None;
    }

    FILENAME_RULES
        .iter()
        .find(|rule| rule.keywords.iter().any(|kw| stem.contains(kw)))
        .map(|rule| rule.category)
}

/// Last path component without extension, lowercased, separators removed
fn normalize_stem(filename: &str) -> String {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let stem = match name.rfind('.') {
        Some(dot) if dot > 0 => &name[..dot],
        _ => name,
    };
    stem.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}
