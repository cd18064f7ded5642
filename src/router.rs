//! URI-template routing
//!
//! Forward matching and reverse building share one parsed template, so
//! request dispatch and URL minting can never disagree about a path.
//!
//! Templates are RFC 6570 restricted to simple `{var}` expansions where a
//! variable spans an entire path segment. Matching is case-sensitive and
//! trailing slashes are literal.

use std::collections::{BTreeSet, HashMap};

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

use crate::error::RouterError;

/// Characters percent-encoded when substituting a value into a path segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Variable(String),
}

#[derive(Debug, Clone)]
struct Template {
    raw: String,
    segments: Vec<Segment>,
}

impl Template {
    fn parse(template: &str) -> Result<Self, RouterError> {
        let malformed = |reason: &str| RouterError::MalformedTemplate {
            template: template.to_string(),
            reason: reason.to_string(),
        };

        if !template.starts_with('/') {
            return Err(malformed("template must start with '/'"));
        }

        let mut segments = Vec::new();
        let mut seen = BTreeSet::new();
        for part in template.split('/') {
            if let Some(name) = part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                if name.is_empty() {
                    return Err(malformed("empty variable name"));
                }
                if !name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
                {
                    return Err(malformed("variable names must be [A-Za-z0-9_]"));
                }
                if !seen.insert(name.to_string()) {
                    return Err(malformed("variable appears more than once"));
                }
                segments.push(Segment::Variable(name.to_string()));
            } else if part.contains('{') || part.contains('}') {
                // Partial-segment expansions like "note-{id}" are not supported.
                return Err(malformed("a variable must span an entire path segment"));
            } else {
                segments.push(Segment::Literal(part.to_string()));
            }
        }

        Ok(Self {
            raw: template.to_string(),
            segments,
        })
    }

    fn variables(&self) -> BTreeSet<String> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Variable(name) => Some(name.clone()),
                Segment::Literal(_) => None,
            })
            .collect()
    }

    /// Number of literal segments; the tiebreaker for overlapping routes.
    fn literal_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count()
    }

    fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let parts: Vec<&str> = path.split('/').collect();
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut values = HashMap::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(literal) => {
                    if literal != part {
                        return None;
                    }
                }
                Segment::Variable(name) => {
                    if part.is_empty() {
                        return None;
                    }
                    let decoded = percent_decode_str(part).decode_utf8().ok()?;
                    values.insert(name.clone(), decoded.into_owned());
                }
            }
        }
        Some(values)
    }

    fn build(&self, values: &HashMap<String, String>) -> Result<String, RouterError> {
        let mut out = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(literal) => out.push(literal.clone()),
                Segment::Variable(name) => {
                    let value = values.get(name).ok_or_else(|| RouterError::BuildFailed {
                        route: self.raw.clone(),
                    })?;
                    out.push(utf8_percent_encode(value, SEGMENT).to_string());
                }
            }
        }
        Ok(out.join("/"))
    }
}

/// A successful forward match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    /// Name the route was registered under
    pub name: String,
    /// Percent-decoded variable values captured from the path
    pub values: HashMap<String, String>,
}

struct Route {
    name: String,
    template: Template,
}

/// Named-route table with forward match and reverse build
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a template under a unique name
    ///
    /// # Returns
    /// The set of variable names the template declares.
    ///
    /// # Errors
    /// `RouterError::DuplicateName` when the name is taken,
    /// `RouterError::MalformedTemplate` when the template does not parse.
    pub fn add(&mut self, template: &str, name: &str) -> Result<BTreeSet<String>, RouterError> {
        if self.has(name) {
            return Err(RouterError::DuplicateName(name.to_string()));
        }
        let template = Template::parse(template)?;
        let variables = template.variables();
        self.routes.push(Route {
            name: name.to_string(),
            template,
        });
        Ok(variables)
    }

    pub fn has(&self, name: &str) -> bool {
        self.routes.iter().any(|r| r.name == name)
    }

    /// Match a request path against every registered route
    ///
    /// When several routes match, the one with the most literal segments
    /// wins; ties fall to the route with fewer variables.
    pub fn route(&self, path: &str) -> Option<RouteMatch> {
        self.routes
            .iter()
            .filter_map(|route| {
                route.template.matches(path).map(|values| {
                    let literals = route.template.literal_count();
                    (literals, values, route)
                })
            })
            .max_by_key(|(literals, values, _)| (*literals, std::cmp::Reverse(values.len())))
            .map(|(_, values, route)| RouteMatch {
                name: route.name.clone(),
                values,
            })
    }

    /// Reverse-build a path for a named route
    ///
    /// Every `{var}` is substituted with the percent-encoded value from
    /// `values`. Returns `None` when the route is unknown or a variable has
    /// no value.
    pub fn build(&self, name: &str, values: &HashMap<String, String>) -> Option<String> {
        let route = self.routes.iter().find(|r| r.name == name)?;
        route.template.build(values).ok()
    }
}
