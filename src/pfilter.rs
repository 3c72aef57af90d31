/*! Packet filter expressions.

A small predicate language gating what the digipeater (and IGate)
will relay. Infix `&`, `|`, `!` and parentheses over a few
primitives:

- `t/MASK` — APRS data type is one of the letters in MASK
  (`p` position, `o` object, `i` item, `m` message, `s` status,
  `t` telemetry, `q` query, `u` user defined, `c` capabilities).
- `b/CALL1/CALL2` — source ("buddy") is one of the calls.
- `d/CALL...` — packet has already been digipeated by one of the calls.
- `v/CALL...` — one of the calls is still unused in the via path.

Call patterns are case-insensitive and accept a trailing `*` wildcard.
Expressions compile once at startup; a malformed filter is a fatal
configuration error.

Example: `t/pm & !b/N0CALL*` — positions and messages, except from
N0CALL stations.
 */
use crate::ax25::{AX25_REPEATER_1, AX25_SOURCE, Packet};
use crate::{Error, Result};

#[derive(Debug)]
enum Node {
    Or(Box<Node>, Box<Node>),
    And(Box<Node>, Box<Node>),
    Not(Box<Node>),
    Types(Vec<char>),
    Buddy(Vec<String>),
    Digied(Vec<String>),
    ViaUnused(Vec<String>),
}

/// A compiled filter expression.
#[derive(Debug)]
pub struct Filter {
    root: Node,
    text: String,
}

fn call_match(pattern: &str, call: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => call.len() >= prefix.len() && call[..prefix.len()].eq_ignore_ascii_case(prefix),
        None => call.eq_ignore_ascii_case(pattern),
    }
}

/// APRS data type letter from the first info byte, or None for
/// non-APRS payloads.
fn type_letter(info: &[u8]) -> Option<char> {
    Some(match info.first()? {
        b'!' | b'=' | b'/' | b'@' | b'`' | b'\'' | b'$' => 'p',
        b';' => 'o',
        b')' => 'i',
        b':' => 'm',
        b'>' => 's',
        b'T' => 't',
        b'?' => 'q',
        b'{' => 'u',
        b'<' => 'c',
        _ => return None,
    })
}

impl Node {
    fn eval(&self, p: &Packet) -> bool {
        match self {
            Node::Or(a, b) => a.eval(p) || b.eval(p),
            Node::And(a, b) => a.eval(p) && b.eval(p),
            Node::Not(a) => !a.eval(p),
            Node::Types(ts) => type_letter(p.info()).is_some_and(|t| ts.contains(&t)),
            Node::Buddy(calls) => {
                let src = p.get_addr(AX25_SOURCE).unwrap_or_default();
                calls.iter().any(|c| call_match(c, &src))
            }
            Node::Digied(calls) => (AX25_REPEATER_1..p.num_addrs()).any(|i| {
                p.get_h(i).unwrap_or(false)
                    && calls
                        .iter()
                        .any(|c| call_match(c, &p.get_addr(i).unwrap_or_default()))
            }),
            Node::ViaUnused(calls) => (AX25_REPEATER_1..p.num_addrs()).any(|i| {
                !p.get_h(i).unwrap_or(true)
                    && calls
                        .iter()
                        .any(|c| call_match(c, &p.get_addr(i).unwrap_or_default()))
            }),
        }
    }
}

struct Parser<'a> {
    toks: Vec<&'a str>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn tokenize(s: &'a str) -> Vec<&'a str> {
        let mut toks = Vec::new();
        let mut start = None;
        for (i, ch) in s.char_indices() {
            match ch {
                '&' | '|' | '!' | '(' | ')' => {
                    if let Some(st) = start.take() {
                        toks.push(&s[st..i]);
                    }
                    toks.push(&s[i..i + 1]);
                }
                c if c.is_whitespace() => {
                    if let Some(st) = start.take() {
                        toks.push(&s[st..i]);
                    }
                }
                _ => {
                    if start.is_none() {
                        start = Some(i);
                    }
                }
            }
        }
        if let Some(st) = start {
            toks.push(&s[st..]);
        }
        toks
    }

    fn peek(&self) -> Option<&'a str> {
        self.toks.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<&'a str> {
        let t = self.peek();
        self.pos += 1;
        t
    }

    fn expr(&mut self) -> Result<Node> {
        let mut left = self.and_term()?;
        while self.peek() == Some("|") {
            self.next();
            left = Node::Or(Box::new(left), Box::new(self.and_term()?));
        }
        Ok(left)
    }

    fn and_term(&mut self) -> Result<Node> {
        let mut left = self.unary()?;
        while self.peek() == Some("&") {
            self.next();
            left = Node::And(Box::new(left), Box::new(self.unary()?));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Node> {
        match self.next() {
            Some("!") => Ok(Node::Not(Box::new(self.unary()?))),
            Some("(") => {
                let e = self.expr()?;
                match self.next() {
                    Some(")") => Ok(e),
                    other => Err(Error::Config(format!(
                        "filter: expected ')', found {other:?}"
                    ))),
                }
            }
            Some(tok) => Self::primitive(tok),
            None => Err(Error::Config("filter: unexpected end of expression".into())),
        }
    }

    fn primitive(tok: &str) -> Result<Node> {
        let (kind, rest) = tok
            .split_once('/')
            .ok_or_else(|| Error::Config(format!("filter: bad primitive {tok:?}")))?;
        let calls = || -> Result<Vec<String>> {
            let v: Vec<String> = rest
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if v.is_empty() {
                return Err(Error::Config(format!("filter: empty call list in {tok:?}")));
            }
            Ok(v)
        };
        match kind {
            "t" => {
                if rest.is_empty() {
                    return Err(Error::Config(format!("filter: empty type mask in {tok:?}")));
                }
                let known = "poimstquc";
                for c in rest.chars() {
                    if !known.contains(c) {
                        return Err(Error::Config(format!(
                            "filter: unknown type letter {c:?} in {tok:?}"
                        )));
                    }
                }
                Ok(Node::Types(rest.chars().collect()))
            }
            "b" => Ok(Node::Buddy(calls()?)),
            "d" => Ok(Node::Digied(calls()?)),
            "v" => Ok(Node::ViaUnused(calls()?)),
            _ => Err(Error::Config(format!(
                "filter: unknown primitive kind {kind:?}"
            ))),
        }
    }
}

impl Filter {
    /// Compile an expression. Fails fast on anything malformed.
    pub fn parse(s: &str) -> Result<Self> {
        let mut p = Parser {
            toks: Parser::tokenize(s),
            pos: 0,
        };
        let root = p.expr()?;
        if p.pos != p.toks.len() {
            return Err(Error::Config(format!(
                "filter: trailing junk after expression: {:?}",
                &p.toks[p.pos..]
            )));
        }
        Ok(Self {
            root,
            text: s.to_string(),
        })
    }

    /// Evaluate against a packet.
    #[must_use]
    pub fn matches(&self, p: &Packet) -> bool {
        self.root.eval(p)
    }

    /// The original expression text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt(mon: &str) -> Packet {
        Packet::from_monitor(mon).unwrap()
    }

    fn eval(expr: &str, mon: &str) -> bool {
        Filter::parse(expr).unwrap().matches(&pkt(mon))
    }

    #[test]
    fn type_filter() {
        assert!(eval("t/p", "A>B:!4903.50N/07201.75W-test"));
        assert!(eval("t/s", "A>B:>status here"));
        assert!(!eval("t/p", "A>B:>status here"));
        assert!(eval("t/pm", "A>B::N0CALL   :hello{1"));
    }

    #[test]
    fn buddy_filter() {
        assert!(eval("b/WB2OSZ-5", "WB2OSZ-5>APDW17:x"));
        assert!(eval("b/wb2osz*", "WB2OSZ-5>APDW17:x"));
        assert!(!eval("b/N0CALL", "WB2OSZ-5>APDW17:x"));
    }

    #[test]
    fn digi_filters() {
        assert!(eval("d/N0CALL*", "A>B,N0CALL-1*,WIDE2-1:x"));
        assert!(!eval("d/WIDE2*", "A>B,N0CALL-1*,WIDE2-1:x"));
        assert!(eval("v/WIDE2*", "A>B,N0CALL-1*,WIDE2-1:x"));
        assert!(!eval("v/N0CALL*", "A>B,N0CALL-1*,WIDE2-1:x"));
    }

    #[test]
    fn boolean_operators() {
        let on = "WB2OSZ-5>APDW17:>st";
        assert!(eval("t/s & b/WB2OSZ*", on));
        assert!(!eval("t/s & b/N0CALL", on));
        assert!(eval("t/p | t/s", on));
        assert!(eval("! t/p", on));
        assert!(eval("( t/p | t/s ) & ! b/N0CALL", on));
    }

    #[test]
    fn parse_errors() {
        for bad in ["", "t/", "t/z", "x/foo", "t/p &", "( t/p", "t/p )", "b/"] {
            assert!(Filter::parse(bad).is_err(), "expected reject: {bad:?}");
        }
    }
}
