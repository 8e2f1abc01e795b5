//! Markup emitted by the multiplexer around the renderer's own output.
//!
//! Every string that reaches the document through here is escaped for the
//! context it lands in: JavaScript string literals inside `<script>`, attribute
//! values, or plain text.

use plexwire::RenderOptions;

/// Where the client should attach the hydrated tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HydrationTarget {
    /// The markup is a full document.
    Document,
    /// The markup is a fragment mounted into an element with this id.
    Outlet(String),
}

impl HydrationTarget {
    fn expression(&self) -> String {
        match self {
            HydrationTarget::Document => "document".into(),
            HydrationTarget::Outlet(id) => format!("document.getElementById({})", js_string(id)),
        }
    }
}

/// Encodes `text` as a JSON string literal that is safe inside an inline `<script>`.
pub fn js_string(text: &str) -> String {
    let quoted = serde_json::Value::String(text.to_string()).to_string();
    quoted
        .replace('<', "\\u003c")
        .replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029")
}

pub fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
    out
}

pub fn escape_attr(text: &str) -> String {
    escape_text(text).replace('"', "&quot;")
}

pub fn script(code: &str) -> String {
    format!("<script>{}</script>", code)
}

/// Payload fragments waiting for the hydration bootstrap.
#[derive(Debug)]
pub struct Bootstrap {
    global: String,
    primed: bool,
    code: String,
    raw: String,
}

impl Bootstrap {
    pub fn new(global: impl Into<String>) -> Self {
        Self { global: global.into(), primed: false, code: String::new(), raw: String::new() }
    }

    /// Statement creating the payload array if the page has not already.
    pub fn preamble(&self) -> String {
        format!("self.{g}=self.{g}||[];", g = self.global)
    }

    /// Statement appending one payload fragment.
    pub fn push_call(&self, text: &str) -> String {
        format!("self.{}.push({});", self.global, js_string(text))
    }

    /// Puts the preamble in front of everything held so far. Idempotent.
    pub fn prime(&mut self) {
        if !self.primed {
            self.code.insert_str(0, &self.preamble());
            self.primed = true;
        }
    }

    pub fn hold(&mut self, text: &str) {
        let call = self.push_call(text);
        self.code.push_str(&call);
        self.raw.push_str(text);
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Takes the held fragments as script statements, preamble first.
    pub fn take_code(&mut self) -> String {
        self.prime();
        self.raw.clear();
        std::mem::take(&mut self.code)
    }

    /// Takes the held fragments as raw payload text.
    pub fn take_raw(&mut self) -> String {
        self.code.clear();
        std::mem::take(&mut self.raw)
    }
}

/// The one-time unit that starts client hydration.
pub fn hydration_unit(options: &RenderOptions, global: &str, held: &str, target: &HydrationTarget) -> String {
    let mut out = String::new();

    if let Some(map) = &options.import_map {
        let json = map.replace().to_string().replace('<', "\\u003c");
        out.push_str(&format!("<script type=\"importmap\">{}</script>", json));
    }

    let wiring = if options.bootstrap_modules.is_empty() && options.bootstrap_scripts.is_empty() {
        format!(
            "typeof self.{g}_hydrate===\"function\"&&self.{g}_hydrate(self.{g}_target);",
            g = global
        )
    } else {
        String::new()
    };
    out.push_str(&script(&format!(
        "{held}self.{g}_target={target};{wiring}",
        g = global,
        target = target.expression(),
    )));

    let loading = if options.defer { "defer" } else { "async" };
    for src in &options.bootstrap_modules {
        out.push_str(&format!("<script type=\"module\" src=\"{}\" {}></script>", escape_attr(src), loading));
    }
    for src in &options.bootstrap_scripts {
        out.push_str(&format!("<script src=\"{}\" {}></script>", escape_attr(src), loading));
    }

    out
}

pub fn stylesheet_links(hrefs: &[String]) -> String {
    hrefs
        .iter()
        .map(|href| format!("<link rel=\"stylesheet\" href=\"{}\" data-precedence=\"default\">", escape_attr(href)))
        .collect()
}

/// Payload that never met a hydration bootstrap, kept in the document as inert text.
pub fn pending_payload(raw: &str) -> String {
    format!("<template data-flight-payload>{}</template>", escape_text(raw))
}

#[cfg(test)]
mod tests {
    use plexwire::Value;

    use super::*;

    #[test]
    fn test_js_string_cannot_close_script() {
        let literal = js_string("</script><script>alert(1)</script>\u{2028}");
        assert!(!literal.contains('<'));
        assert!(literal.contains("\\u003c/script>"));
        assert!(literal.contains("\\u2028"));
    }

    #[test]
    fn test_bootstrap_preamble_goes_first() {
        let mut boot = Bootstrap::new("__flight_data");
        boot.hold("1:I[]\n");
        boot.prime();
        boot.prime();
        let code = boot.take_code();
        assert!(code.starts_with("self.__flight_data=self.__flight_data||[];"));
        assert_eq!(code.matches("||[]").count(), 1);
        assert!(code.ends_with("self.__flight_data.push(\"1:I[]\\n\");"));
        assert!(boot.is_empty());
    }

    #[test]
    fn test_hydration_unit_with_modules() {
        let options = RenderOptions {
            bootstrap_modules: vec!["/client.js".into()],
            defer: true,
            import_map: Some(Value::from_iter([("imports", Value::from_iter([("a", Value::from("/a.js"))]))])),
            ..Default::default()
        };
        let unit = hydration_unit(&options, "__flight_data", "", &HydrationTarget::Outlet("root".into()));
        assert!(unit.starts_with("<script type=\"importmap\">{\"imports\":{\"a\":\"/a.js\"}}</script>"));
        assert!(unit.contains("document.getElementById(\"root\")"));
        assert!(unit.contains("<script type=\"module\" src=\"/client.js\" defer></script>"));
        assert!(!unit.contains("_hydrate"));
    }

    #[test]
    fn test_hydration_unit_without_modules_wires_inline() {
        let unit = hydration_unit(&RenderOptions::default(), "g", "X;", &HydrationTarget::Document);
        assert!(unit.starts_with("<script>X;self.g_target=document;"));
        assert!(unit.contains("self.g_hydrate(self.g_target)"));
    }

    #[test]
    fn test_pending_payload_is_text_escaped() {
        assert_eq!(
            pending_payload("0:\"<b>&\"\n"),
            "<template data-flight-payload>0:\"&lt;b&gt;&amp;\"\n</template>"
        );
    }
}
