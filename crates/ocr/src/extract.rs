use std::sync::OnceLock;

use billscan_core::Money;
use regex::Regex;
use tracing::debug;

use crate::types::{
    AmountCandidate, Diagnostic, ExtractedReceipt, Field, MatchTier, Priority, UNKNOWN_BUSINESS,
};

// ── Compiled regex cache ─────────────────────────────────────────────────────

macro_rules! re {
    ($name:ident, $pat:expr) => {
        fn $name() -> &'static Regex {
            static R: OnceLock<Regex> = OnceLock::new();
            R.get_or_init(|| Regex::new($pat).expect("invalid regex"))
        }
    };
}

// Boilerplate words match as word prefixes ("CASHIER", "TAXABLE"); short ones as whole words.
re!(re_org_denylist,
    r"(?i)\b(?:receipt|invoice|bill|tax|total|subtotal|payment|date|time|card|cash|address|phone|telephone|gst|cgst|sgst|particulars|qty|rate|amount|grand|thank|visit|service|take|away|counter|type|compound|chowk|building|bldg)\w*|\b(?:no|tel|sub|dis|net|boy)\b");
re!(re_letters3, r"[a-zA-Z]{3,}");
re!(re_letters5, r"[a-zA-Z]{5,}");
re!(re_name_noise, r"[^a-zA-Z0-9\s&'-]");
re!(re_all_caps, r"^[A-Z\s]{3,}$");
re!(re_caps_run, r"[A-Z]{2,}");
re!(re_whitespace, r"\s+");
re!(re_business_suffix,
    r"(?i)\s+(?:restaurant|hotel|cafe|bar|grill|kitchen|food|center|centre|store|shop|market|plaza|mall|complex|building|bldg|non-veg|pure\s+veg|veg|pure)$");

re!(re_tip_any_sep, r"(?i)tip[\s:]*\$?\s*(\d+)[.,](\d{2})");
re!(re_tip_dot, r"(?i)tip[\s:]*\$?\s*(\d+)\.(\d{2})");
re!(re_gratuity, r"(?i)gratuity[\s:]*\$?\s*(\d+)[.,](\d{2})");
re!(re_service, r"(?i)service[\s:]*\$?\s*(\d+)[.,](\d{2})");

re!(re_grand_total, r"(?i)grand\s*total[\s:]*\$?\s*(\d+)(?:[.,](\d{1,2})\b)?");
re!(re_first_integer, r"(\d+)");

re!(re_kw_total, r"(?i)\btotal[\s:]*\$?\s*(\d+)[.,]?(\d{0,2})");
re!(re_kw_amount_due, r"(?i)amount\s*due[\s:]*\$?\s*(\d+)[.,]?(\d{0,2})");
re!(re_kw_balance, r"(?i)balance[\s:]*\$?\s*(\d+)[.,]?(\d{0,2})");
re!(re_kw_amount, r"(?i)amount[\s:]*\$?\s*(\d+)[.,]?(\d{0,2})");
re!(re_kw_total_amount, r"(?i)total\s*amount[\s:]*\$?\s*(\d+)[.,]?(\d{0,2})");
re!(re_kw_net_total, r"(?i)net\s*total[\s:]*\$?\s*(\d+)[.,]?(\d{0,2})");
re!(re_kw_final_amount, r"(?i)final\s*amount[\s:]*\$?\s*(\d+)[.,]?(\d{0,2})");

re!(re_sweep_noise,
    r"(?i)\b(?:tax|subtotal|discount|change|item|sold|particulars|qty|quantity|rate|amount|cgst|sgst|thank|visit|service|take|away|counter|type|address|phone|telephone|gst)\w*|\b(?:no|tel|sub|dis|net|boy)\b");
re!(re_total_hint, r"(?i)total|grand|final|balance|due");
re!(re_currency_token, r"\b(\d+)(?:[.,](\d{1,2}))?\b");

re!(re_loose_decimal, r"(\d+)\s*[.,]\s*(\d{2})");

/// Only the top of the receipt is searched for the business name.
const HEADER_LINES: usize = 10;
const MAX_ORGANIZATION_CHARS: usize = 50;

fn amount_cap() -> Money {
    Money::from_cents(1_000_000)
}

fn tip_cap() -> Money {
    Money::from_cents(100_000)
}

/// Split recognizer output into trimmed, non-empty lines, preserving order.
pub fn scan_lines(text: &str) -> Vec<&str> {
    text.lines().map(str::trim).filter(|l| !l.is_empty()).collect()
}

// ── Amount cascade ───────────────────────────────────────────────────────────

/// One independent amount strategy over the whole document.
pub type AmountMatcher = fn(&[&str]) -> Option<AmountCandidate>;

/// Strategies in the order they are tried. The first to produce a candidate wins.
pub const AMOUNT_CASCADE: [(MatchTier, AmountMatcher); 4] = [
    (MatchTier::GrandTotal, match_grand_total),
    (MatchTier::TotalKeyword, match_total_keyword),
    (MatchTier::CurrencySweep, match_currency_sweep),
    (MatchTier::AggressiveDecimal, match_aggressive_decimal),
];

/// Run `matchers` in order and return the first hit with the tier that produced it.
pub fn run_cascade(
    lines: &[&str],
    matchers: &[(MatchTier, AmountMatcher)],
) -> Option<(MatchTier, AmountCandidate)> {
    matchers
        .iter()
        .find_map(|(tier, matcher)| matcher(lines).map(|c| (*tier, c)))
}

fn in_amount_range(value: Money) -> bool {
    value.is_between(Money::zero(), amount_cap())
}

fn candidate(value: Money, line: &str, priority: Priority) -> AmountCandidate {
    AmountCandidate { value, source_line: line.to_string(), priority }
}

fn match_grand_total(lines: &[&str]) -> Option<AmountCandidate> {
    lines.iter().find_map(|line| {
        let value = if let Some(c) = re_grand_total().captures(line) {
            Money::from_parts(&c[1], c.get(2).map_or("", |m| m.as_str()))
        } else if line.to_lowercase().contains("grand total") {
            let c = re_first_integer().captures(line)?;
            Money::from_parts(&c[1], "")
        } else {
            None
        }?;
        in_amount_range(value).then(|| candidate(value, line, Priority::High))
    })
}

fn match_total_keyword(lines: &[&str]) -> Option<AmountCandidate> {
    let patterns: [fn() -> &'static Regex; 7] = [
        re_kw_total,
        re_kw_amount_due,
        re_kw_balance,
        re_kw_amount,
        re_kw_total_amount,
        re_kw_net_total,
        re_kw_final_amount,
    ];
    lines.iter().find_map(|line| {
        patterns.iter().find_map(|pattern| {
            let c = pattern().captures(line)?;
            let value = Money::from_parts(&c[1], c.get(2).map_or("", |m| m.as_str()))?;
            in_amount_range(value).then(|| candidate(value, line, Priority::High))
        })
    })
}

fn match_currency_sweep(lines: &[&str]) -> Option<AmountCandidate> {
    let mut candidates: Vec<AmountCandidate> = Vec::new();
    for line in lines {
        let total_hint = re_total_hint().is_match(line);
        if re_sweep_noise().is_match(line) && !total_hint {
            continue;
        }
        let priority = if total_hint { Priority::High } else { Priority::Low };
        for c in re_currency_token().captures_iter(line) {
            let Some(value) = Money::from_parts(&c[1], c.get(2).map_or("", |m| m.as_str())) else {
                continue;
            };
            if in_amount_range(value) {
                candidates.push(candidate(value, line, priority));
            }
        }
    }
    candidates.sort_by(|a, b| a.rank(b));
    candidates.into_iter().next()
}

fn match_aggressive_decimal(lines: &[&str]) -> Option<AmountCandidate> {
    lines
        .iter()
        .flat_map(|line| {
            re_loose_decimal()
                .captures_iter(line)
                .filter_map(|c| Money::from_parts(&c[1], &c[2]))
                .filter(|v| in_amount_range(*v))
                .map(|v| candidate(v, line, Priority::Low))
                .collect::<Vec<_>>()
        })
        // Earliest line wins ties.
        .fold(None, |best: Option<AmountCandidate>, c| match best {
            Some(b) if b.value >= c.value => Some(b),
            _ => Some(c),
        })
}

// ── Public extraction API ─────────────────────────────────────────────────────

pub struct Extractor;

impl Extractor {
    /// Extract organization, amount and tip from raw OCR text.
    ///
    /// Never fails: fields that cannot be found keep their defaults
    /// (`"Unknown Business"`, zero, zero) so a human can correct them.
    pub fn extract(ocr_text: &str) -> ExtractedReceipt {
        let lines = scan_lines(ocr_text);
        let mut diagnostics = Vec::new();

        let organization = Self::extract_organization(&lines, &mut diagnostics);
        let tip = Self::extract_tip(&lines, &mut diagnostics);
        let amount = match run_cascade(&lines, &AMOUNT_CASCADE) {
            Some((tier, winner)) => {
                diagnostics.push(Diagnostic {
                    field: Field::Amount,
                    tier,
                    line: winner.source_line.clone(),
                    value: winner.value.as_decimal().to_string(),
                });
                winner.value
            }
            None => Money::zero(),
        };

        for d in &diagnostics {
            debug!(field = ?d.field, tier = ?d.tier, line = %d.line, value = %d.value, "receipt field matched");
        }

        ExtractedReceipt { organization, amount, tip, diagnostics }
    }

    // ── Organization ──────────────────────────────────────────────────────────

    fn extract_organization(lines: &[&str], diagnostics: &mut Vec<Diagnostic>) -> String {
        let header = lines.iter().take(HEADER_LINES).find_map(|line| {
            let len = line.chars().count();
            if !(3..=60).contains(&len)
                || line.starts_with(|c: char| c.is_ascii_digit())
                || re_org_denylist().is_match(line)
                || !re_letters3().is_match(line)
            {
                return None;
            }
            let name = clean_name(line);
            (re_all_caps().is_match(&name) || re_caps_run().is_match(&name))
                .then(|| (MatchTier::HeaderLine, *line, name))
        });

        let found = header.or_else(|| {
            lines.iter().find_map(|line| {
                let len = line.chars().count();
                if !(4..=50).contains(&len)
                    || !re_letters5().is_match(line)
                    || re_org_denylist().is_match(line)
                {
                    return None;
                }
                let name = clean_name(line);
                (!name.is_empty()).then(|| (MatchTier::TextHeavyLine, *line, name))
            })
        });

        match found {
            Some((tier, line, name)) => {
                let name = tidy_organization(&name);
                diagnostics.push(Diagnostic {
                    field: Field::Organization,
                    tier,
                    line: line.to_string(),
                    value: name.clone(),
                });
                name
            }
            None => UNKNOWN_BUSINESS.to_string(),
        }
    }

    // ── Tip ───────────────────────────────────────────────────────────────────

    fn extract_tip(lines: &[&str], diagnostics: &mut Vec<Diagnostic>) -> Money {
        let patterns: [fn() -> &'static Regex; 4] =
            [re_tip_any_sep, re_tip_dot, re_gratuity, re_service];

        let hit = lines.iter().find_map(|line| {
            patterns.iter().find_map(|pattern| {
                let c = pattern().captures(line)?;
                let value = Money::from_parts(&c[1], &c[2])?;
                value.is_between(Money::zero(), tip_cap()).then_some((*line, value))
            })
        });

        match hit {
            Some((line, value)) => {
                diagnostics.push(Diagnostic {
                    field: Field::Tip,
                    tier: MatchTier::TipKeyword,
                    line: line.to_string(),
                    value: value.as_decimal().to_string(),
                });
                value
            }
            None => Money::zero(),
        }
    }
}

// ── Name helpers ──────────────────────────────────────────────────────────────

fn clean_name(line: &str) -> String {
    re_name_noise().replace_all(line, "").trim().to_string()
}

/// Collapse whitespace, cap the length, drop a trailing "CAFE"/"RESTAURANT"-style suffix.
fn tidy_organization(name: &str) -> String {
    let collapsed = re_whitespace().replace_all(name.trim(), " ");
    let truncated: String = collapsed.chars().take(MAX_ORGANIZATION_CHARS).collect();
    let truncated = truncated.trim_end();
    let stripped = re_business_suffix().replace(truncated, "");
    if stripped.trim().is_empty() {
        truncated.to_string()
    } else {
        stripped.trim().to_string()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
