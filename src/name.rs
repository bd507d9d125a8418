//! Canonical, composable derivation names.
//!
//! A [`Name`] is the parsed form of strings like `abc123+resize(200,200).jpg`.
//! Two names are equal iff their canonical rendering is byte-identical.

use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::AppError;

/// A single derivation step, in application order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Original(String),
    Size(u32, u32),
    Crop(u32, u32, u32, u32),
    Thumbnail(u32, u32, ThumbnailFlags),
    Convert(String),
    Metadata(String),
}

impl Op {
    fn render(&self) -> String {
        match self {
            Op::Original(raw) => format!("original({raw})"),
            Op::Size(w, h) => format!("size({w},{h})"),
            Op::Crop(w, h, x, y) => format!("crop({w},{h},{x},{y})"),
            Op::Thumbnail(w, h, flags) => format!("thumbnail({w},{h},{})", flags.encode()),
            Op::Convert(fmt) => format!("convert({fmt})"),
            Op::Metadata(kind) => format!("metadata({kind})"),
        }
    }

    fn parse(token: &str) -> Result<Op, AppError> {
        let open = token
            .find('(')
            .ok_or_else(|| malformed(format!("op has no parameter list: {token}")))?;
        if !token.ends_with(')') {
            return Err(malformed(format!("op missing closing paren: {token}")));
        }
        let name = &token[..open];
        let params = &token[open + 1..token.len() - 1];
        match name {
            "original" => Ok(Op::Original(params.to_string())),
            "size" => {
                let (w, h) = two_u32(params)?;
                Ok(Op::Size(w, h))
            }
            "crop" => {
                let parts = split_params(params, 4)?;
                Ok(Op::Crop(
                    parse_u32(&parts[0])?,
                    parse_u32(&parts[1])?,
                    parse_u32(&parts[2])?,
                    parse_u32(&parts[3])?,
                ))
            }
            "thumbnail" => {
                let parts = split_params(params, 3)?;
                Ok(Op::Thumbnail(
                    parse_u32(&parts[0])?,
                    parse_u32(&parts[1])?,
                    ThumbnailFlags::parse(&parts[2]),
                ))
            }
            "convert" => Ok(Op::Convert(params.to_string())),
            "metadata" => Ok(Op::Metadata(params.to_string())),
            other => Err(malformed(format!("unknown op: {other}"))),
        }
    }
}

fn malformed(msg: String) -> AppError {
    AppError::MalformedName(msg)
}

fn split_params(params: &str, count: usize) -> Result<Vec<String>, AppError> {
    let parts: Vec<String> = params.split(',').map(|s| s.to_string()).collect();
    if parts.len() != count {
        return Err(malformed(format!(
            "expected {count} parameters, found {}: {params}",
            parts.len()
        )));
    }
    Ok(parts)
}

fn two_u32(params: &str) -> Result<(u32, u32), AppError> {
    let parts = split_params(params, 2)?;
    Ok((parse_u32(&parts[0])?, parse_u32(&parts[1])?))
}

fn parse_u32(s: &str) -> Result<u32, AppError> {
    s.trim()
        .parse::<u32>()
        .map_err(|_| malformed(format!("not a valid integer: {s}")))
}

/// The letter-encoded flag set carried by `thumbnail(...)`.
///
/// Rendered as a sorted subset of `e`, `l`, `s` (equalise, liquid rescale, sharpen).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThumbnailFlags {
    pub equalise: bool,
    pub liquid: bool,
    pub sharpen: bool,
}

impl ThumbnailFlags {
    pub fn encode(&self) -> String {
        let mut s = String::new();
        if self.equalise {
            s.push('e');
        }
        if self.liquid {
            s.push('l');
        }
        if self.sharpen {
            s.push('s');
        }
        s
    }

    pub fn parse(s: &str) -> Self {
        ThumbnailFlags {
            equalise: s.contains('e'),
            liquid: s.contains('l'),
            sharpen: s.contains('s'),
        }
    }
}

/// A parsed, canonical derivation name.
#[derive(Debug, Clone)]
pub struct Name {
    base: String,
    ops: Vec<Op>,
    format: String,
    clone_marker: bool,
}

impl Name {
    /// Builds a bare base name with no derivation ops.
    pub fn base(base: impl Into<String>, format: impl Into<String>) -> Self {
        Name {
            base: base.into(),
            ops: Vec::new(),
            format: format.into(),
            clone_marker: false,
        }
    }

    /// Parses a canonical string. `format_hint` overrides extension splitting
    /// for callers that already know the target format (e.g. from an upload's
    /// content type) and are handed a name without one.
    pub fn parse(s: &str, format_hint: Option<&str>) -> Result<Name, AppError> {
        let (head, format) = match format_hint {
            Some(fmt) => (s, fmt.to_string()),
            None => {
                let dot = s
                    .rfind('.')
                    .ok_or_else(|| malformed(format!("name has no format suffix: {s}")))?;
                (&s[..dot], s[dot + 1..].to_string())
            }
        };
        let mut components = head.split('+');
        let base = components
            .next()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| malformed(format!("name has no base: {s}")))?
            .to_string();
        let mut ops = Vec::new();
        let mut clone_marker = false;
        for component in components {
            if component == "clone()" {
                clone_marker = true;
                continue;
            }
            ops.push(Op::parse(component)?);
        }
        Ok(Name {
            base,
            ops,
            format,
            clone_marker,
        })
    }

    pub fn render(&self) -> String {
        let mut s = self.base.clone();
        if self.clone_marker {
            s.push_str("+clone()");
        }
        for op in &self.ops {
            s.push('+');
            s.push_str(&op.render());
        }
        s.push('.');
        s.push_str(&self.format);
        s
    }

    pub fn base_name(&self) -> &str {
        &self.base
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// `base.format` with every derivation op stripped.
    pub fn master(&self) -> String {
        format!("{}.{}", self.base, self.format)
    }

    pub fn is_base(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn is_original(&self) -> bool {
        matches!(self.ops.as_slice(), [Op::Original(_)])
    }

    pub fn is_derived(&self) -> bool {
        !self.ops.is_empty() && !self.is_original()
    }

    pub fn is_thumbnail(&self) -> bool {
        self.ops.iter().any(|op| matches!(op, Op::Thumbnail(..)))
    }

    pub fn is_resize(&self) -> bool {
        self.ops.iter().any(|op| matches!(op, Op::Size(..)))
    }

    pub fn is_convert(&self) -> bool {
        self.ops.iter().any(|op| matches!(op, Op::Convert(_)))
    }

    pub fn is_metadata(&self) -> bool {
        self.ops.iter().any(|op| matches!(op, Op::Metadata(_)))
    }

    /// Clones this name, marking the copy with a transient `+clone()` marker.
    /// The marker disappears the moment any `apply_*` call lands a new op.
    pub fn clone_marked(&self) -> Name {
        let mut n = self.clone();
        n.clone_marker = true;
        n
    }

    pub fn apply_original(&mut self, raw_name: &str) {
        self.clone_marker = false;
        self.ops = vec![Op::Original(urlencoding::encode(raw_name).into_owned())];
    }

    pub fn apply_resize(&mut self, w: u32, h: u32, format: Option<&str>) {
        self.clone_marker = false;
        self.ops.push(Op::Size(w, h));
        if let Some(f) = format {
            self.format = f.to_string();
        }
    }

    pub fn apply_crop(&mut self, w: u32, h: u32, x: u32, y: u32, format: Option<&str>) {
        self.clone_marker = false;
        self.ops.push(Op::Crop(w, h, x, y));
        if let Some(f) = format {
            self.format = f.to_string();
        }
    }

    pub fn apply_thumbnail(&mut self, w: u32, h: u32, flags: ThumbnailFlags, format: &str) {
        self.clone_marker = false;
        self.ops.push(Op::Thumbnail(w, h, flags));
        self.format = format.to_string();
    }

    /// Only needed when converting with no other derivation op in play; a no-op
    /// once the name already carries another op, since that op already settled
    /// the target format.
    pub fn apply_convert(&mut self, format: &str) {
        self.clone_marker = false;
        if self.is_derived() {
            return;
        }
        self.ops.push(Op::Convert(format.to_string()));
        self.format = format.to_string();
    }

    pub fn apply_metadata(&mut self, kind: &str) {
        self.clone_marker = false;
        self.ops = vec![Op::Metadata(kind.to_string())];
        self.format = kind.to_string();
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        self.render() == other.render()
    }
}

impl Eq for Name {}

impl Hash for Name {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.render().hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_base() {
        let n = Name::parse("abc123.jpg", None).unwrap();
        assert_eq!(n.render(), "abc123.jpg");
        assert!(n.is_base());
    }

    #[test]
    fn roundtrip_derived() {
        let s = "abc123+size(200,100)+convert(png).png";
        let n = Name::parse(s, None).unwrap();
        assert_eq!(n.render(), s);
        assert!(n.is_derived());
    }

    #[test]
    fn unknown_op_is_malformed() {
        let err = Name::parse("abc123+frobnicate(1).jpg", None).unwrap_err();
        assert!(matches!(err, AppError::MalformedName(_)));
    }

    #[test]
    fn clone_marker_present_until_next_op() {
        let mut n = Name::parse("abc123+size(10,10).jpg", None).unwrap();
        let cloned = n.clone_marked();
        assert_eq!(cloned.render(), "abc123+clone()+size(10,10).jpg");
        n.apply_crop(1, 1, 0, 0, None);
        assert!(!n.render().contains("clone()"));
    }

    #[test]
    fn thumbnail_flags_sorted() {
        let mut n = Name::base("abc123", "jpg");
        n.apply_thumbnail(
            10,
            10,
            ThumbnailFlags {
                sharpen: true,
                equalise: true,
                liquid: false,
            },
            "jpg",
        );
        assert!(n.render().contains("thumbnail(10,10,es)"));
    }

    #[test]
    fn convert_noop_once_derived() {
        let mut n = Name::base("abc123", "jpg");
        n.apply_resize(10, 10, None);
        n.apply_convert("png");
        assert_eq!(n.format(), "jpg");
        assert!(!n.render().contains("convert"));
    }
}
