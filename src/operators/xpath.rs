//! Tolerant HTML/XML tree builder and an XPath subset used by `xpath`
//! matchers and extractors.
//!
//! Supported steps: `/name`, `//name`, `*`, `@attr`, `text()`, with
//! predicates `[n]`, `[@attr]`, `[@attr='value']`, `[contains(@attr,'v')]`
//! and `[contains(text(),'v')]`. A relative path is evaluated as if it
//! started with `//`.

use crate::errors::TemplarError;

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source", "track", "wbr",
];
const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style"];

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    fn new(name: &str) -> Self {
        Self { name: name.to_string(), attributes: Vec::new(), children: Vec::new() }
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.iter().find(|(key, _)| key == name).map(|(_, value)| value.as_str())
    }

    /// Concatenated, whitespace-trimmed text of every descendant text node.
    pub fn text(&self) -> String {
        let mut out = String::new();
        collect_text(self, &mut out);
        out.trim().to_string()
    }

    fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(element) => Some(element),
            Node::Text(_) => None,
        })
    }

    fn descendants<'a>(&'a self, out: &mut Vec<&'a Element>) {
        for child in self.child_elements() {
            out.push(child);
            child.descendants(out);
        }
    }

    fn direct_text(&self) -> Vec<String> {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(text) => Some(text.trim().to_string()),
                Node::Element(_) => None,
            })
            .filter(|text| !text.is_empty())
            .collect()
    }
}

fn collect_text(element: &Element, out: &mut String) {
    for child in &element.children {
        match child {
            Node::Text(text) => out.push_str(text),
            Node::Element(inner) => collect_text(inner, out),
        }
    }
}

fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

/// Build a document tree. Never fails: unknown or unbalanced markup is
/// repaired the way browsers do it, by closing open elements.
pub fn parse_document(input: &str) -> Element {
    let mut stack = vec![Element::new("#document")];
    let mut rest = input;

    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("<!--") {
            rest = after.find("-->").map(|i| &after[i + 3..]).unwrap_or("");
        } else if rest.starts_with("<!") || rest.starts_with("<?") {
            rest = rest.find('>').map(|i| &rest[i + 1..]).unwrap_or("");
        } else if let Some(after) = rest.strip_prefix("</") {
            let end = after.find('>').unwrap_or(after.len());
            let name = after[..end].trim().to_ascii_lowercase();
            rest = after.get(end + 1..).unwrap_or("");
            close_element(&mut stack, &name);
        } else if rest.len() > 1 && rest.starts_with('<') && rest.as_bytes()[1].is_ascii_alphabetic() {
            let (element, self_closing, consumed) = parse_tag(rest);
            rest = &rest[consumed..];
            let name = element.name.clone();
            if self_closing || VOID_ELEMENTS.contains(&name.as_str()) {
                push_child(&mut stack, Node::Element(element));
            } else if RAW_TEXT_ELEMENTS.contains(&name.as_str()) {
                let closing = format!("</{}", name);
                let end = rest.to_ascii_lowercase().find(&closing).unwrap_or(rest.len());
                let mut element = element;
                if !rest[..end].trim().is_empty() {
                    element.children.push(Node::Text(rest[..end].to_string()));
                }
                push_child(&mut stack, Node::Element(element));
                rest = &rest[end..];
                rest = match rest.find('>') {
                    Some(i) => &rest[i + 1..],
                    None => "",
                };
            } else {
                stack.push(element);
            }
        } else {
            let skip = rest.chars().next().map(char::len_utf8).unwrap_or(1);
            let end = rest[skip..].find('<').map(|i| i + skip).unwrap_or(rest.len());
            let text = &rest[..end];
            if !text.trim().is_empty() {
                push_child(&mut stack, Node::Text(decode_entities(text)));
            }
            rest = &rest[end..];
        }
    }

    while stack.len() > 1 {
        if let Some(open) = stack.pop() {
            push_child(&mut stack, Node::Element(open));
        }
    }
    stack.pop().unwrap_or_else(|| Element::new("#document"))
}

fn push_child(stack: &mut [Element], node: Node) {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(node);
    }
}

fn close_element(stack: &mut Vec<Element>, name: &str) {
    let Some(position) = stack.iter().rposition(|element| element.name == name) else {
        return;
    };
    if position == 0 {
        return;
    }
    while stack.len() > position {
        if let Some(open) = stack.pop() {
            push_child(stack, Node::Element(open));
        }
    }
}

/// Parse an opening tag at the start of `input`.
/// Returns the element, whether it was self-closing, and the bytes consumed.
fn parse_tag(input: &str) -> (Element, bool, usize) {
    let bytes = input.as_bytes();
    let len = bytes.len();
    let mut i = 1;
    while i < len && !bytes[i].is_ascii_whitespace() && bytes[i] != b'>' && bytes[i] != b'/' {
        i += 1;
    }
    let mut element = Element::new(&input[1..i].to_ascii_lowercase());
    let mut self_closing = false;

    loop {
        while i < len && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= len {
            break;
        }
        match bytes[i] {
            b'>' => {
                i += 1;
                break;
            }
            b'/' => {
                i += 1;
                if i < len && bytes[i] == b'>' {
                    self_closing = true;
                }
                continue;
            }
            _ => {}
        }

        let name_start = i;
        while i < len && !bytes[i].is_ascii_whitespace() && !matches!(bytes[i], b'=' | b'>' | b'/') {
            i += 1;
        }
        let name = input[name_start..i].to_ascii_lowercase();
        while i < len && bytes[i].is_ascii_whitespace() {
            i += 1;
        }

        let mut value = String::new();
        if i < len && bytes[i] == b'=' {
            i += 1;
            while i < len && bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            if i < len && (bytes[i] == b'"' || bytes[i] == b'\'') {
                let quote = bytes[i];
                i += 1;
                let value_start = i;
                while i < len && bytes[i] != quote {
                    i += 1;
                }
                value = decode_entities(&input[value_start..i]);
                if i < len {
                    i += 1;
                }
            } else {
                let value_start = i;
                while i < len && !bytes[i].is_ascii_whitespace() && bytes[i] != b'>' {
                    i += 1;
                }
                value = decode_entities(&input[value_start..i]);
            }
        }
        if !name.is_empty() {
            element.attributes.push((name, value));
        }
    }

    (element, self_closing, i)
}

#[derive(Debug, Clone, PartialEq)]
enum NodeTest {
    Name(String),
    Any,
    Text,
    Attribute(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Predicate {
    Position(usize),
    HasAttribute(String),
    AttributeEquals(String, String),
    AttributeContains(String, String),
    TextContains(String),
}

#[derive(Debug, Clone, PartialEq)]
struct Step {
    descendant: bool,
    test: NodeTest,
    predicates: Vec<Predicate>,
}

/// A selected node: an element, or a string value (attribute or text).
#[derive(Debug, Clone, PartialEq)]
pub enum Selected<'a> {
    Element(&'a Element),
    Value(String),
}

impl Selected<'_> {
    pub fn text(&self) -> String {
        match self {
            Selected::Element(element) => element.text(),
            Selected::Value(value) => value.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct XPath {
    source: String,
    steps: Vec<Step>,
}

fn invalid(expression: &str, message: &str) -> TemplarError {
    TemplarError::Compile(format!("invalid xpath '{}': {}", expression, message))
}

fn unquote(value: &str) -> Option<&str> {
    let value = value.trim();
    value
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .or_else(|| value.strip_prefix('"').and_then(|v| v.strip_suffix('"')))
}

fn parse_predicate(raw: &str, expression: &str) -> Result<Predicate, TemplarError> {
    let raw = raw.trim();
    if let Ok(position) = raw.parse::<usize>() {
        if position == 0 {
            return Err(invalid(expression, "positions start at 1"));
        }
        return Ok(Predicate::Position(position));
    }
    if let Some(args) = raw.strip_prefix("contains(").and_then(|r| r.strip_suffix(')')) {
        let (target, needle) = args.split_once(',').ok_or_else(|| invalid(expression, "contains() takes two arguments"))?;
        let needle = unquote(needle).ok_or_else(|| invalid(expression, "contains() needle must be quoted"))?.to_string();
        let target = target.trim();
        return match target.strip_prefix('@') {
            Some(attribute) => Ok(Predicate::AttributeContains(attribute.to_ascii_lowercase(), needle)),
            None if target == "text()" || target == "." => Ok(Predicate::TextContains(needle)),
            None => Err(invalid(expression, "contains() target must be @attr, text() or .")),
        };
    }
    if let Some(attribute) = raw.strip_prefix('@') {
        return match attribute.split_once('=') {
            Some((name, value)) => {
                let value = unquote(value).ok_or_else(|| invalid(expression, "attribute value must be quoted"))?;
                Ok(Predicate::AttributeEquals(name.trim().to_ascii_lowercase(), value.to_string()))
            }
            None => Ok(Predicate::HasAttribute(attribute.trim().to_ascii_lowercase())),
        };
    }
    Err(invalid(expression, &format!("unsupported predicate '{}'", raw)))
}

fn parse_step(raw: &str, descendant: bool, expression: &str) -> Result<Step, TemplarError> {
    let (head, mut rest) = match raw.find('[') {
        Some(i) => (&raw[..i], &raw[i..]),
        None => (raw, ""),
    };
    let head = head.trim();
    let test = if head == "*" {
        NodeTest::Any
    } else if head == "text()" {
        NodeTest::Text
    } else if let Some(attribute) = head.strip_prefix('@') {
        NodeTest::Attribute(attribute.to_ascii_lowercase())
    } else if !head.is_empty() && head.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':')) {
        NodeTest::Name(head.to_ascii_lowercase())
    } else {
        return Err(invalid(expression, &format!("unsupported step '{}'", raw)));
    };

    let mut predicates = Vec::new();
    while !rest.is_empty() {
        let inner = rest.strip_prefix('[').ok_or_else(|| invalid(expression, "expected '['"))?;
        let close = inner.find(']').ok_or_else(|| invalid(expression, "unclosed '['"))?;
        predicates.push(parse_predicate(&inner[..close], expression)?);
        rest = inner[close + 1..].trim_start();
    }
    Ok(Step { descendant, test, predicates })
}

/// Split on `/` outside of brackets and quotes, tracking `//` separators.
fn split_steps(expression: &str) -> Vec<(bool, String)> {
    let mut steps = Vec::new();
    let mut current = String::new();
    let mut descendant = !expression.starts_with('/');
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut chars = expression.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, quote) {
            (q, Some(open)) if q == open => {
                quote = None;
                current.push(c);
            }
            (_, Some(_)) => current.push(c),
            ('\'' | '"', None) => {
                quote = Some(c);
                current.push(c);
            }
            ('[', None) => {
                depth += 1;
                current.push(c);
            }
            (']', None) => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ('/', None) if depth == 0 => {
                if !current.is_empty() {
                    steps.push((descendant, std::mem::take(&mut current)));
                }
                descendant = chars.peek() == Some(&'/');
                if descendant {
                    chars.next();
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        steps.push((descendant, current));
    }
    steps
}

impl XPath {
    pub fn compile(expression: &str) -> Result<Self, TemplarError> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Err(invalid(expression, "empty expression"));
        }
        let raw_steps = split_steps(trimmed);
        if raw_steps.is_empty() {
            return Err(invalid(expression, "no steps"));
        }
        let mut steps = Vec::with_capacity(raw_steps.len());
        let last = raw_steps.len() - 1;
        for (index, (descendant, raw)) in raw_steps.iter().enumerate() {
            let step = parse_step(raw, *descendant, expression)?;
            if index != last && matches!(step.test, NodeTest::Attribute(_) | NodeTest::Text) {
                return Err(invalid(expression, "@attr and text() must be the final step"));
            }
            steps.push(step);
        }
        Ok(Self { source: expression.to_string(), steps })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn select<'a>(&self, document: &'a Element) -> Vec<Selected<'a>> {
        let mut context: Vec<&'a Element> = vec![document];
        for step in &self.steps {
            match &step.test {
                NodeTest::Attribute(name) => {
                    return scope(&context, step.descendant, true)
                        .into_iter()
                        .filter_map(|element| element.attribute(name))
                        .map(|value| Selected::Value(value.to_string()))
                        .collect();
                }
                NodeTest::Text => {
                    return scope(&context, step.descendant, true)
                        .into_iter()
                        .flat_map(|element| element.direct_text())
                        .map(Selected::Value)
                        .collect();
                }
                NodeTest::Name(_) | NodeTest::Any => {
                    let mut next: Vec<&'a Element> = Vec::new();
                    for element in &context {
                        let candidates: Vec<&'a Element> = scope(&[*element], step.descendant, false)
                            .into_iter()
                            .filter(|candidate| step_matches(&step.test, candidate))
                            .collect();
                        for candidate in apply_predicates(candidates, &step.predicates) {
                            if !next.iter().any(|seen| std::ptr::eq(*seen, candidate)) {
                                next.push(candidate);
                            }
                        }
                    }
                    context = next;
                }
            }
            if context.is_empty() {
                break;
            }
        }
        context.into_iter().map(Selected::Element).collect()
    }

    /// Convenience for callers that only need string results.
    pub fn select_text(&self, document: &Element) -> Vec<String> {
        self.select(document).iter().map(Selected::text).collect()
    }
}

/// Elements a step looks at: children, or every descendant for `//`.
/// With `include_self` the context elements are part of the scope too.
fn scope<'a>(context: &[&'a Element], descendant: bool, include_self: bool) -> Vec<&'a Element> {
    let mut out = Vec::new();
    for element in context {
        if include_self {
            out.push(*element);
            if descendant {
                element.descendants(&mut out);
            }
        } else if descendant {
            element.descendants(&mut out);
        } else {
            out.extend(element.child_elements());
        }
    }
    out
}

fn step_matches(test: &NodeTest, element: &Element) -> bool {
    match test {
        NodeTest::Name(name) => element.name == *name,
        NodeTest::Any => true,
        NodeTest::Text | NodeTest::Attribute(_) => false,
    }
}

fn apply_predicates<'a>(mut candidates: Vec<&'a Element>, predicates: &[Predicate]) -> Vec<&'a Element> {
    for predicate in predicates {
        candidates = match predicate {
            Predicate::Position(position) => candidates.get(position - 1).copied().into_iter().collect(),
            Predicate::HasAttribute(name) => candidates.into_iter().filter(|e| e.attribute(name).is_some()).collect(),
            Predicate::AttributeEquals(name, value) => {
                candidates.into_iter().filter(|e| e.attribute(name) == Some(value.as_str())).collect()
            }
            Predicate::AttributeContains(name, needle) => candidates
                .into_iter()
                .filter(|e| e.attribute(name).map(|v| v.contains(needle.as_str())).unwrap_or(false))
                .collect(),
            Predicate::TextContains(needle) => {
                candidates.into_iter().filter(|e| e.text().contains(needle.as_str())).collect()
            }
        };
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Admin &amp; Login</title><meta name="generator" content="WordPress 6.1"></head>
<body>
  <!-- comment -->
  <div class="nav"><a href="/home">Home</a><a href="/login" id="login">Sign in</a></div>
  <form action="/auth"><input type="hidden" name="csrf" value="t0k3n"><br></form>
  <script>if (a < b) { x = "</div>"; }</script>
  <p>unclosed paragraph
</body>
</html>"#;

    fn texts(expression: &str) -> Vec<String> {
        XPath::compile(expression).unwrap().select_text(&parse_document(PAGE))
    }

    #[test]
    fn test_title_and_entities() {
        assert_eq!(texts("/html/head/title"), vec!["Admin & Login"]);
        assert_eq!(texts("//title/text()"), vec!["Admin & Login"]);
    }

    #[test]
    fn test_attribute_selection() {
        assert_eq!(texts("//a/@href"), vec!["/home", "/login"]);
        assert_eq!(texts("//meta[@name='generator']/@content"), vec!["WordPress 6.1"]);
        assert_eq!(texts("//input[@name=\"csrf\"]/@value"), vec!["t0k3n"]);
    }

    #[test]
    fn test_predicates() {
        assert_eq!(texts("//div/a[2]"), vec!["Sign in"]);
        assert_eq!(texts("//a[@id]"), vec!["Sign in"]);
        assert_eq!(texts("//a[contains(@href,'log')]"), vec!["Sign in"]);
        assert_eq!(texts("//a[contains(text(),'Home')]/@href"), vec!["/home"]);
    }

    #[test]
    fn test_relative_and_wildcard() {
        assert_eq!(texts("title"), vec!["Admin & Login"]);
        assert_eq!(texts("//div[@class='nav']/*").len(), 2);
    }

    #[test]
    fn test_tolerates_broken_markup() {
        assert_eq!(texts("//p"), vec!["unclosed paragraph"]);
        assert!(texts("//script")[0].contains("</div>"));
        assert!(texts("//missing").is_empty());
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(XPath::compile("").is_err());
        assert!(XPath::compile("//a/@href/b").is_err());
        assert!(XPath::compile("//a[0]").is_err());
        assert!(XPath::compile("//a[foo(]").is_err());
    }
}
