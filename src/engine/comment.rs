//! Trade Comment Grammar (§6)
//!
//! `STRATEGY[|RANGE][|DIRECTION][|CONFIRMATIONS]`, at most 31 characters
//! (the MT-style comment field limit the original source targets).
//! Strategy attribution has no dedicated field on `Position` — it is
//! encoded here and recovered by a tolerant prefix match for legacy forms
//! (§9 "Strategy-to-position attribution").

pub const MAX_COMMENT_LEN: usize = 31;

/// Recognized strategy tags.
pub const STRATEGIES: &[&str] = &["TB", "FB", "HFT"];

/// Recognized reference-range tags.
pub const RANGES: &[&str] = &["15M_1M", "4H_5M"];

/// A parsed trade comment.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TradeComment {
    pub strategy: String,
    pub range: Option<String>,
    pub direction: Option<String>,
    pub confirmations: Option<String>,
}

impl TradeComment {
    pub fn new(strategy: impl Into<String>) -> Self {
        Self {
            strategy: strategy.into(),
            range: None,
            direction: None,
            confirmations: None,
        }
    }

    pub fn with_range(mut self, range: impl Into<String>) -> Self {
        self.range = Some(range.into());
        self
    }

    pub fn with_direction(mut self, direction: impl Into<String>) -> Self {
        self.direction = Some(direction.into());
        self
    }

    pub fn with_confirmations(mut self, confirmations: impl Into<String>) -> Self {
        self.confirmations = Some(confirmations.into());
        self
    }

    /// Render the comment, truncating confirmations first if the result
    /// would exceed `MAX_COMMENT_LEN` (confirmations are diagnostic, the
    /// other fields are load-bearing for attribution and duplicate checks).
    pub fn render(&self) -> String {
        let mut parts = vec![self.strategy.clone()];
        if let Some(r) = &self.range {
            parts.push(r.clone());
        }
        if let Some(d) = &self.direction {
            parts.push(d.clone());
        }
        if let Some(c) = &self.confirmations {
            parts.push(c.clone());
        }
        let mut rendered = parts.join("|");
        while rendered.len() > MAX_COMMENT_LEN {
            if self.confirmations.is_some() && parts.len() == 4 {
                parts.pop();
                rendered = parts.join("|");
            } else {
                rendered.truncate(MAX_COMMENT_LEN);
                break;
            }
        }
        rendered
    }

    /// Parse a rendered comment. Tolerates legacy forms missing trailing
    /// fields by falling back to a prefix match on the known strategy
    /// tags (§9).
    pub fn parse(comment: &str) -> Self {
        let mut fields = comment.split('|');
        let strategy = fields.next().unwrap_or_default().to_string();
        Self {
            strategy,
            range: fields.next().map(str::to_string),
            direction: fields.next().map(str::to_string),
            confirmations: fields.next().map(str::to_string),
        }
    }
}

/// Extract the strategy tag from a comment, tolerating legacy/malformed
/// forms by matching the longest known strategy prefix (§9).
pub fn strategy_of(comment: &str) -> &str {
    if let Some(idx) = comment.find('|') {
        return &comment[..idx];
    }
    for known in STRATEGIES {
        if comment.starts_with(known) {
            return known;
        }
    }
    comment
}

/// The (symbol, side, strategy-tag) key used for duplicate-position
/// prevention (§4.3).
pub fn duplicate_key(symbol: &str, side: crate::engine::tick::Side, comment: &str) -> (String, crate::engine::tick::Side, String) {
    (symbol.to_string(), side, strategy_of(comment).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tick::Side;

    #[test]
    fn renders_and_parses_round_trip() {
        let c = TradeComment::new("TB")
            .with_range("15M_1M")
            .with_direction("buy")
            .with_confirmations("VTS");
        let rendered = c.render();
        assert_eq!(rendered, "TB|15M_1M|buy|VTS");
        let parsed = TradeComment::parse(&rendered);
        assert_eq!(parsed, c);
    }

    #[test]
    fn render_never_exceeds_max_len() {
        let c = TradeComment::new("HFT")
            .with_range("4H_5M")
            .with_direction("sell")
            .with_confirmations("VOLUMETRENDSPREADSPACEANGLED");
        assert!(c.render().len() <= MAX_COMMENT_LEN);
    }

    #[test]
    fn strategy_of_handles_legacy_prefix_only_form() {
        assert_eq!(strategy_of("TBsomelegacysuffix"), "TB");
        assert_eq!(strategy_of("FB|4H_5M|buy"), "FB");
    }

    #[test]
    fn duplicate_key_groups_by_symbol_side_and_strategy() {
        let a = duplicate_key("EURUSD", Side::Buy, "TB|15M_1M|buy");
        let b = duplicate_key("EURUSD", Side::Buy, "TB|4H_5M|buy|V");
        assert_eq!(a, b);
    }
}
