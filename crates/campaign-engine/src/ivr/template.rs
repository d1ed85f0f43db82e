//! Textual placeholder substitution for menu messages.
//!
//! `{name}` is replaced by the matching value; unknown placeholders
//! are left in place verbatim.

use std::collections::HashMap;

/// Render a message template against the answer/value map
pub fn render(template: &str, values: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        match tail.find('}') {
            Some(close) => {
                let name = &tail[1..close];
                match values.get(name) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&tail[..=close]),
                }
                rest = &tail[close + 1..];
            }
            None => {
                out.push_str(tail);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Single-placeholder convenience
pub fn render_one(template: &str, name: &str, value: &str) -> String {
    let mut values = HashMap::new();
    values.insert(name.to_string(), value.to_string());
    render(template, &values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_known_placeholders() {
        let out = render(
            "You are number {position} in line.",
            &values(&[("position", "3")]),
        );
        assert_eq!(out, "You are number 3 in line.");
    }

    #[test]
    fn unknown_placeholders_stay_in_place() {
        let out = render("Pay on day {day} at {hour}.", &values(&[("day", "15")]));
        assert_eq!(out, "Pay on day 15 at {hour}.");
    }

    #[test]
    fn handles_repeats_and_unterminated_braces() {
        let out = render("{x} and {x} and {", &values(&[("x", "y")]));
        assert_eq!(out, "y and y and {");
    }

    #[test]
    fn render_one_matches_render() {
        assert_eq!(
            render_one("Confirmed for day {day}.", "day", "15"),
            "Confirmed for day 15."
        );
    }
}
