//! Conversion between file-side markup and the collection's rich text.

/// `parse(render(x)) == x` must hold for every markup string.
pub trait TextTransform: Send + Sync {
	fn render(&self, markup: &str) -> String;
	fn parse(&self, rich: &str) -> String;
}

/// Minimal HTML mapping: entity escaping plus line breaks.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlText;

impl TextTransform for HtmlText {
	fn render(&self, markup: &str) -> String {
		let mut out = String::with_capacity(markup.len());
		for c in markup.chars() {
			match c {
				'&' => out.push_str("&amp;"),
				'<' => out.push_str("&lt;"),
				'>' => out.push_str("&gt;"),
				'\n' => out.push_str("<br>"),
				other => out.push(other),
			}
		}
		out
	}

	fn parse(&self, rich: &str) -> String {
		let mut out = String::with_capacity(rich.len());
		let mut rest = rich;
		while let Some(pos) = rest.find(['&', '<']) {
			out.push_str(&rest[..pos]);
			rest = &rest[pos..];
			let (replacement, len) = if let Some(len) = break_tag_len(rest) {
				("\n", len)
			} else if rest.starts_with("&amp;") {
				("&", 5)
			} else if rest.starts_with("&lt;") {
				("<", 4)
			} else if rest.starts_with("&gt;") {
				(">", 4)
			} else if rest.starts_with("&nbsp;") {
				(" ", 6)
			} else {
				(&rest[..1], 1)
			};
			out.push_str(replacement);
			rest = &rest[len..];
		}
		out.push_str(rest);
		out
	}
}

// Accepts <br>, <br/> and <br />, any case.
fn break_tag_len(s: &str) -> Option<usize> {
	for tag in ["<br>", "<br/>", "<br />"] {
		if s.get(..tag.len()).is_some_and(|p| p.eq_ignore_ascii_case(tag)) {
			return Some(tag.len());
		}
	}
	None
}
