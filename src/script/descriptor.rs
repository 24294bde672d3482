//! Oracle descriptors.
//!
//! Parsing an oracle extracts its entry function (the first function
//! declared), the entry function's formal parameters, an optional merge
//! function and every `records.Find(<param>)` call site in the entry body.
//! Those call sites are what [`OracleDescriptor::patch_code`] rewrites so
//! that a node can run the oracle against records it does not own.

use crate::codec::{null_record, record_to_compressed_text};
use crate::error::{CodecError, ScriptError};
use crate::proto;
use oxc_allocator::Allocator;
use oxc_ast::ast::{Argument, BindingPatternKind, CallExpression, Function, Statement};
use oxc_ast::visit::walk;
use oxc_ast::Visit;
use oxc_parser::Parser;
use oxc_span::{GetSpan, SourceType};
use std::collections::{BTreeSet, HashMap};
use tracing::warn;

/// Callee text (whitespace removed) of the record lookup builtin.
const LOOKUP_CALLEE: &str = "records.Find";
/// Name prefix marking a merge function.
const MERGE_PREFIX: &str = "merge";

/// Byte span of one `records.Find(param)` call in the oracle source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupSite {
    pub parameter: usize,
    pub start: usize,
    pub end: usize,
}

/// Outcome of resolving one record-lookup argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Found(proto::Record),
    /// Embedded as the null placeholder; the script checks `IsNull()`.
    Missing,
}

#[derive(Debug, Clone)]
pub struct OracleDescriptor {
    pub id: u64,
    pub name: String,
    source: String,
    entry: String,
    parameters: Vec<String>,
    lookups: BTreeSet<usize>,
    sites: Vec<LookupSite>,
    merge: Option<String>,
}

impl OracleDescriptor {
    pub fn parse(name: impl Into<String>, source: impl Into<String>) -> Result<Self, ScriptError> {
        let name = name.into();
        let source = source.into();
        let Analysis {
            entry,
            parameters,
            merge,
            lookups,
            sites,
        } = analyze(&name, &source)?;
        Ok(Self {
            id: 0,
            name,
            source,
            entry,
            parameters,
            lookups,
            sites,
            merge,
        })
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn parameters(&self) -> &[String] {
        &self.parameters
    }

    pub fn merge_function(&self) -> Option<&str> {
        self.merge.as_deref()
    }

    pub fn is_lookup(&self, position: usize) -> bool {
        self.lookups.contains(&position)
    }

    pub fn sites(&self) -> &[LookupSite] {
        &self.sites
    }

    /// Rewrite every lookup call whose parameter was resolved into a
    /// `records.New('<token>')` literal. `resolved` is aligned with the
    /// entry function's parameters; `None` leaves the call untouched.
    pub fn patch_code(&self, resolved: &[Option<Resolution>]) -> Result<String, CodecError> {
        let mut literals: HashMap<usize, String> = HashMap::new();
        let mut edits: Vec<(LookupSite, usize)> = Vec::new();

        for site in &self.sites {
            let Some(Some(resolution)) = resolved.get(site.parameter) else {
                continue;
            };
            if !literals.contains_key(&site.parameter) {
                let token = match resolution {
                    Resolution::Found(record) => record_to_compressed_text(record)?,
                    Resolution::Missing => record_to_compressed_text(&null_record())?,
                };
                literals.insert(site.parameter, format!("records.New('{token}')"));
            }
            edits.push((*site, site.parameter));
        }
        edits.sort_by_key(|(site, _)| site.start);

        let mut patched = self.source.clone();
        let mut shift: isize = 0;
        for (site, parameter) in edits {
            let literal = &literals[&parameter];
            let start = (site.start as isize + shift) as usize;
            let end = (site.end as isize + shift) as usize;
            patched.replace_range(start..end, literal);
            shift += literal.len() as isize - (site.end - site.start) as isize;
        }
        Ok(patched)
    }

    pub fn as_proto(&self) -> proto::Oracle {
        proto::Oracle {
            id: self.id,
            name: self.name.clone(),
            code: self.source.clone(),
        }
    }

    /// Same name and same code.
    pub fn is_equal_to(&self, oracle: &proto::Oracle) -> bool {
        self.name == oracle.name && self.source == oracle.code
    }
}

struct Analysis {
    entry: String,
    parameters: Vec<String>,
    merge: Option<String>,
    lookups: BTreeSet<usize>,
    sites: Vec<LookupSite>,
}

fn analyze(name: &str, source: &str) -> Result<Analysis, ScriptError> {
    let allocator = Allocator::default();
    let parsed = Parser::new(&allocator, source, SourceType::default().with_script(true)).parse();
    if let Some(err) = parsed.errors.first() {
        return Err(ScriptError::Parse(err.to_string()));
    }
    if parsed.panicked {
        return Err(ScriptError::Parse("unrecoverable syntax error".to_string()));
    }

    let functions: Vec<&Function<'_>> = parsed
        .program
        .body
        .iter()
        .filter_map(|stmt| match stmt {
            Statement::FunctionDeclaration(func) => Some(&**func),
            _ => None,
        })
        .collect();
    let (entry_fn, rest) = functions.split_first().ok_or(ScriptError::NoFunction)?;

    let entry = function_name(entry_fn);
    let parameters = parameter_names(entry_fn);

    let mut merge = None;
    for candidate in rest {
        let candidate_name = function_name(candidate);
        if !candidate_name.starts_with(MERGE_PREFIX) {
            continue;
        }
        let arity = candidate.params.items.len();
        if arity != 1 {
            warn!(oracle = %name, function = %candidate_name, arity, "ignoring merge function: expected exactly one argument");
            continue;
        }
        merge = Some(candidate_name);
        break;
    }

    let mut collector = LookupCollector {
        source,
        parameters: &parameters,
        lookups: BTreeSet::new(),
        sites: Vec::new(),
    };
    if !parameters.is_empty() {
        if let Some(body) = &entry_fn.body {
            collector.visit_function_body(body);
        }
    }
    let LookupCollector { lookups, sites, .. } = collector;

    Ok(Analysis {
        entry,
        parameters,
        merge,
        lookups,
        sites,
    })
}

fn function_name(func: &Function<'_>) -> String {
    func.id
        .as_ref()
        .map(|id| id.name.to_string())
        .unwrap_or_default()
}

fn parameter_names(func: &Function<'_>) -> Vec<String> {
    func.params
        .items
        .iter()
        .map(|param| match &param.pattern.kind {
            BindingPatternKind::BindingIdentifier(id) => id.name.to_string(),
            _ => String::new(),
        })
        .collect()
}

struct LookupCollector<'s> {
    source: &'s str,
    parameters: &'s [String],
    lookups: BTreeSet<usize>,
    sites: Vec<LookupSite>,
}

impl LookupCollector<'_> {
    fn match_lookup(&self, call: &CallExpression<'_>) -> Option<usize> {
        if call.arguments.len() != 1 {
            return None;
        }
        let callee = call.callee.span();
        let text: String = self.source[callee.start as usize..callee.end as usize]
            .split_whitespace()
            .collect();
        if text != LOOKUP_CALLEE {
            return None;
        }
        let Argument::Identifier(ident) = &call.arguments[0] else {
            return None;
        };
        self.parameters.iter().position(|p| p == ident.name.as_str())
    }
}

impl<'a> Visit<'a> for LookupCollector<'_> {
    fn visit_call_expression(&mut self, call: &CallExpression<'a>) {
        match self.match_lookup(call) {
            Some(parameter) => {
                self.lookups.insert(parameter);
                self.sites.push(LookupSite {
                    parameter,
                    start: call.span.start as usize,
                    end: call.span.end as usize,
                });
            }
            None => walk::walk_call_expression(self, call),
        }
    }
}
