//! Text clean-up shared by the TASE scrapers.

/// Parse a number as printed on TASE pages: `52,341.00`, `-0.66%`,
/// `‎−1.2`, `₪ 523.41`.
pub fn parse_tase_number(text: &str) -> Option<f64> {
    let cleaned: String = text
        .chars()
        .filter_map(|c| match c {
            '\u{2212}' | '\u{2013}' => Some('-'),
            ',' | '%' | '₪' | '\u{200e}' | '\u{200f}' | '\u{00a0}' => None,
            c if c.is_whitespace() => None,
            c => Some(c),
        })
        .collect();
    let value: f64 = cleaned.parse().ok()?;
    value.is_finite().then_some(value)
}

/// Repair a display name scraped from TASE sources: decode the HTML
/// entities they leak, restore Hebrew gershayim written as two apostrophes
/// (`בע''מ` → `בע"מ`) and collapse whitespace.
pub fn repair_display_name(raw: &str) -> Option<String> {
    let decoded = raw
        .replace("&quot;", "\"")
        .replace("&#34;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("''", "\"");
    let collapsed = decoded.split_whitespace().collect::<Vec<_>>().join(" ");
    (!collapsed.is_empty()).then_some(collapsed)
}
