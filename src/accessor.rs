//! A small accessor-chain language used to bind output fields to object
//! members at runtime.
//!
//! A chain like `var("hltEgammaHoverEUnseeded",0)` or
//! `eventAuxiliary().run()` is parsed once into a list of [`AccessorStep`]s
//! and then resolved against any object implementing [`FieldAccess`],
//! without the binding site knowing the object's concrete type. Parsing is
//! the expensive part; callers should hold on to the parsed steps (or a
//! [`UnaryFunc`]) and reuse them for every event.

use std::fmt;
use std::sync::Arc;

use crate::{EgHltError, EgHltResult};

/// A literal argument parsed out of a call segment.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    /// An integer literal, e.g. `0`
    Int(i64),
    /// A float literal, e.g. `2.5`
    Float(f64),
    /// A string literal; surrounding double quotes have been stripped
    Str(String),
}

impl ArgValue {
    /// Widen numeric literals to `f64`; string literals are not numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ArgValue::Int(value) => Some(*value as f64),
            ArgValue::Float(value) => Some(*value),
            ArgValue::Str(_) => None,
        }
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Int(value) => write!(f, "{value}"),
            ArgValue::Float(value) => write!(f, "{value}"),
            ArgValue::Str(value) => write!(f, "\"{value}\""),
        }
    }
}

/// One parsed unit of a dotted accessor chain.
#[derive(Debug, Clone, PartialEq)]
pub enum AccessorStep {
    /// A bare member read, e.g. `et`
    Attribute(String),
    /// A member invocation, e.g. `et()` or `var("name",0)`
    Call {
        /// Name of the member to invoke
        name: String,
        /// Coerced literal arguments
        args: Vec<ArgValue>,
    },
}

impl AccessorStep {
    /// The member name this step looks up.
    pub fn name(&self) -> &str {
        match self {
            AccessorStep::Attribute(name) => name,
            AccessorStep::Call { name, .. } => name,
        }
    }
}

/// A runtime value produced by resolving an accessor step.
#[derive(Clone)]
pub enum FieldValue {
    /// An integer scalar
    Int(i64),
    /// A float scalar
    Float(f64),
    /// A boolean scalar
    Bool(bool),
    /// A string scalar
    Str(String),
    /// An intermediate object which further steps can be applied to
    Object(Arc<dyn FieldAccess>),
}

impl FieldValue {
    /// A short name for the kind of value, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            FieldValue::Int(_) => "int",
            FieldValue::Float(_) => "float",
            FieldValue::Bool(_) => "bool",
            FieldValue::Str(_) => "string",
            FieldValue::Object(obj) => obj.type_name(),
        }
    }

    /// Widen to `f64` where the value is numeric (booleans count as 0/1).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Int(value) => Some(*value as f64),
            FieldValue::Float(value) => Some(*value),
            FieldValue::Bool(value) => Some(u8::from(*value) as f64),
            _ => None,
        }
    }

    /// Narrow to `i64` where the value is integral.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(value) => Some(*value),
            FieldValue::Bool(value) => Some(i64::from(*value)),
            _ => None,
        }
    }
}

impl fmt::Debug for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int(value) => write!(f, "Int({value})"),
            FieldValue::Float(value) => write!(f, "Float({value})"),
            FieldValue::Bool(value) => write!(f, "Bool({value})"),
            FieldValue::Str(value) => write!(f, "Str({value:?})"),
            FieldValue::Object(obj) => write!(f, "Object({})", obj.type_name()),
        }
    }
}

/// The capability interface accessor chains resolve against.
///
/// Implementors expose their members by name; the resolver stays ignorant of
/// the concrete type. Missing members must surface as
/// [`EgHltError::UnresolvedAccessor`]; any other error returned from
/// [`call_method`](FieldAccess::call_method) is wrapped by the resolver into
/// [`EgHltError::Invocation`] with the rendered call prepended.
pub trait FieldAccess: Send + Sync {
    /// Concrete type name, used in error messages.
    fn type_name(&self) -> &'static str;
    /// Read a member without invoking it.
    fn get_field(&self, name: &str) -> EgHltResult<FieldValue>;
    /// Invoke a member with coerced literal arguments.
    fn call_method(&self, name: &str, args: &[ArgValue]) -> EgHltResult<FieldValue>;

    /// The standard error for a member this type does not have.
    fn no_such_member(&self, name: &str) -> EgHltError {
        EgHltError::UnresolvedAccessor {
            type_name: self.type_name().to_string(),
            segment: name.to_string(),
        }
    }
}

/// Parse an accessor chain into its step list.
///
/// The chain is split on `.` at parenthesis depth zero (so float literals
/// inside argument lists survive), empty segments are skipped, and each
/// remaining segment must be a bare identifier, a zero-argument call, or a
/// call with a literal argument list.
pub fn parse(chain: &str) -> EgHltResult<Vec<AccessorStep>> {
    let mut steps = Vec::new();
    for segment in split_chain(chain) {
        if segment.is_empty() {
            continue;
        }
        steps.push(parse_segment(chain, segment)?);
    }
    Ok(steps)
}

fn split_chain(chain: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (idx, ch) in chain.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            '.' if depth == 0 => {
                segments.push(&chain[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    segments.push(&chain[start..]);
    segments
}

fn is_ident(text: &str) -> bool {
    !text.is_empty()
        && text
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

fn is_arg_text(text: &str) -> bool {
    text.chars().all(|ch| {
        ch.is_ascii_alphanumeric() || matches!(ch, '_' | '"' | '\'' | ',' | '.' | ' ')
    })
}

fn parse_segment(chain: &str, segment: &str) -> EgHltResult<AccessorStep> {
    if is_ident(segment) {
        return Ok(AccessorStep::Attribute(segment.to_string()));
    }
    if let Some(open) = segment.find('(') {
        let name = &segment[..open];
        if is_ident(name) && segment.ends_with(')') {
            let body = &segment[open + 1..segment.len() - 1];
            if is_arg_text(body) {
                return Ok(AccessorStep::Call {
                    name: name.to_string(),
                    args: parse_args(body),
                });
            }
        }
    }
    Err(EgHltError::MalformedAccessor {
        chain: chain.to_string(),
        segment: segment.to_string(),
    })
}

fn parse_args(body: &str) -> Vec<ArgValue> {
    let mut args = Vec::new();
    if body.trim().is_empty() {
        return args;
    }
    for raw in body.split(',') {
        let text = raw.trim();
        if let Ok(value) = text.parse::<i64>() {
            // An integer argument ends the list. Existing field bindings
            // encode this, so it must stay.
            args.push(ArgValue::Int(value));
            break;
        }
        if let Ok(value) = text.parse::<f64>() {
            args.push(ArgValue::Float(value));
            continue;
        }
        let text = text
            .strip_prefix('"')
            .and_then(|inner| inner.strip_suffix('"'))
            .unwrap_or(text);
        args.push(ArgValue::Str(text.to_string()));
    }
    args
}

fn render_call(name: &str, args: &[ArgValue]) -> String {
    let rendered = args
        .iter()
        .map(|arg| arg.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    format!("{name}({rendered})")
}

/// Resolve a parsed step list against an object.
///
/// Steps apply left to right; each call's return value becomes the target of
/// the next step, so intermediate steps must yield [`FieldValue::Object`].
pub fn resolve(obj: &dyn FieldAccess, steps: &[AccessorStep]) -> EgHltResult<FieldValue> {
    let (first, rest) = steps
        .split_first()
        .ok_or_else(|| EgHltError::Custom("Cannot resolve an empty accessor chain".to_string()))?;
    let mut current = apply_step(obj, first)?;
    for step in rest {
        let target = match &current {
            FieldValue::Object(inner) => inner.clone(),
            value => {
                return Err(EgHltError::UnresolvedAccessor {
                    type_name: value.kind().to_string(),
                    segment: step.name().to_string(),
                })
            }
        };
        current = apply_step(target.as_ref(), step)?;
    }
    Ok(current)
}

fn apply_step(target: &dyn FieldAccess, step: &AccessorStep) -> EgHltResult<FieldValue> {
    match step {
        AccessorStep::Attribute(name) => target.get_field(name),
        AccessorStep::Call { name, args } => {
            target.call_method(name, args).map_err(|err| match err {
                unresolved @ EgHltError::UnresolvedAccessor { .. } => unresolved,
                other => EgHltError::Invocation {
                    call: render_call(name, args),
                    source: Box::new(other),
                },
            })
        }
    }
}

type PlainFn = dyn Fn(&dyn FieldAccess) -> EgHltResult<FieldValue> + Send + Sync;
type BoundFn = dyn Fn(&dyn FieldAccess, &[ArgValue]) -> EgHltResult<FieldValue> + Send + Sync;

/// A one-argument callable over event objects, built from a chain string, a
/// partially-bound function, or a plain function.
///
/// All three forms are invoked identically through [`eval`](UnaryFunc::eval),
/// which is what lets ntuple columns mix hand-written closures with
/// string-configured bindings.
#[derive(Clone)]
pub enum UnaryFunc {
    /// A parsed accessor chain, resolved against the object on every call
    Chain(Vec<AccessorStep>),
    /// A function invoked with the object prepended to bound arguments
    Bound {
        /// The underlying callable
        func: Arc<BoundFn>,
        /// Arguments bound at construction time
        args: Vec<ArgValue>,
    },
    /// A function invoked directly with the object
    Plain(Arc<PlainFn>),
}

impl UnaryFunc {
    /// Build from an accessor chain, parsing it once.
    pub fn chain(chain: &str) -> EgHltResult<Self> {
        Ok(UnaryFunc::Chain(parse(chain)?))
    }

    /// Build from a function plus leading bound arguments.
    pub fn bound<F>(func: F, args: Vec<ArgValue>) -> Self
    where
        F: Fn(&dyn FieldAccess, &[ArgValue]) -> EgHltResult<FieldValue> + Send + Sync + 'static,
    {
        UnaryFunc::Bound {
            func: Arc::new(func),
            args,
        }
    }

    /// Build from a plain one-argument function.
    pub fn plain<F>(func: F) -> Self
    where
        F: Fn(&dyn FieldAccess) -> EgHltResult<FieldValue> + Send + Sync + 'static,
    {
        UnaryFunc::Plain(Arc::new(func))
    }

    /// Evaluate against an object.
    pub fn eval(&self, obj: &dyn FieldAccess) -> EgHltResult<FieldValue> {
        match self {
            UnaryFunc::Chain(steps) => resolve(obj, steps),
            UnaryFunc::Bound { func, args } => func(obj, args),
            UnaryFunc::Plain(func) => func(obj),
        }
    }
}

impl fmt::Debug for UnaryFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnaryFunc::Chain(steps) => f.debug_tuple("Chain").field(steps).finish(),
            UnaryFunc::Bound { args, .. } => f.debug_struct("Bound").field("args", args).finish(),
            UnaryFunc::Plain(_) => f.write_str("Plain"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{EgTrigObj, EventAux, EventBank};
    use approx::assert_relative_eq;

    fn test_obj() -> EgTrigObj {
        let mut obj = EgTrigObj::new(51.2, 63.0, -0.7, 1.2);
        obj.set_var("hltEgammaClusterShapeUnseeded_sigmaIEtaIEta5x5", 0.011);
        obj.set_var("hltEgammaHoverEUnseeded", 0.05);
        obj
    }

    #[test]
    fn parse_forms() {
        assert_eq!(
            parse("et").unwrap(),
            vec![AccessorStep::Attribute("et".to_string())]
        );
        assert_eq!(
            parse("et()").unwrap(),
            vec![AccessorStep::Call {
                name: "et".to_string(),
                args: vec![]
            }]
        );
        assert_eq!(
            parse("var(\"hltEgammaHoverEUnseeded\",0)").unwrap(),
            vec![AccessorStep::Call {
                name: "var".to_string(),
                args: vec![
                    ArgValue::Str("hltEgammaHoverEUnseeded".to_string()),
                    ArgValue::Int(0)
                ]
            }]
        );
        assert_eq!(
            parse("eventAuxiliary().run()").unwrap(),
            vec![
                AccessorStep::Call {
                    name: "eventAuxiliary".to_string(),
                    args: vec![]
                },
                AccessorStep::Call {
                    name: "run".to_string(),
                    args: vec![]
                },
            ]
        );
    }

    #[test]
    fn parse_float_args_survive_the_dot_split() {
        assert_eq!(
            parse("scaled(2.5).et").unwrap(),
            vec![
                AccessorStep::Call {
                    name: "scaled".to_string(),
                    args: vec![ArgValue::Float(2.5)]
                },
                AccessorStep::Attribute("et".to_string()),
            ]
        );
    }

    #[test]
    fn parse_skips_empty_segments() {
        assert_eq!(
            parse("et..energy").unwrap(),
            vec![
                AccessorStep::Attribute("et".to_string()),
                AccessorStep::Attribute("energy".to_string()),
            ]
        );
        assert!(parse("").unwrap().is_empty());
    }

    #[test]
    fn parse_rejects_malformed_segments() {
        for chain in ["et(", "et)", "e-t", "var(x;y)", "va r()"] {
            match parse(chain) {
                Err(EgHltError::MalformedAccessor { .. }) => {}
                other => panic!("expected MalformedAccessor for {chain:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn int_argument_ends_the_list() {
        // var(1,2) must coerce to [1] only; downstream bindings depend on it.
        let steps = parse("var(1,2)").unwrap();
        assert_eq!(
            steps,
            vec![AccessorStep::Call {
                name: "var".to_string(),
                args: vec![ArgValue::Int(1)]
            }]
        );
        // ...but arguments before the integer are kept.
        let steps = parse("var(\"x\",2.5,0,7)").unwrap();
        assert_eq!(
            steps,
            vec![AccessorStep::Call {
                name: "var".to_string(),
                args: vec![
                    ArgValue::Str("x".to_string()),
                    ArgValue::Float(2.5),
                    ArgValue::Int(0)
                ]
            }]
        );
    }

    #[test]
    fn unquoted_text_stays_a_string() {
        let steps = parse("var(hltVar)").unwrap();
        assert_eq!(
            steps,
            vec![AccessorStep::Call {
                name: "var".to_string(),
                args: vec![ArgValue::Str("hltVar".to_string())]
            }]
        );
    }

    #[test]
    fn resolve_zero_arg_call_round_trip() {
        let obj = test_obj();
        let value = resolve(&obj, &parse("et()").unwrap()).unwrap();
        assert_relative_eq!(value.as_f64().unwrap(), 51.2);
    }

    #[test]
    fn resolve_var_call_with_coerced_args() {
        let obj = test_obj();
        let value = resolve(
            &obj,
            &parse("var(\"hltEgammaHoverEUnseeded\",0)").unwrap(),
        )
        .unwrap();
        assert_relative_eq!(value.as_f64().unwrap(), 0.05);
        // Unknown variable names fall back to the supplied default.
        let value = resolve(&obj, &parse("var(\"noSuchVar\",0)").unwrap()).unwrap();
        assert_relative_eq!(value.as_f64().unwrap(), 0.0);
    }

    #[test]
    fn resolve_chain_through_intermediate_object() {
        let bank = EventBank::new(EventAux {
            run: 346512,
            lumi_sec: 12,
            event_nr: 9001,
        });
        let value = resolve(&bank, &parse("eventAuxiliary().run()").unwrap()).unwrap();
        assert_eq!(value.as_i64().unwrap(), 346512);
        let value = resolve(&bank, &parse("eventAuxiliary().event()").unwrap()).unwrap();
        assert_eq!(value.as_i64().unwrap(), 9001);
    }

    #[test]
    fn resolve_missing_member_is_unresolved() {
        let obj = test_obj();
        match resolve(&obj, &parse("nosuch()").unwrap()) {
            Err(EgHltError::UnresolvedAccessor { segment, .. }) => {
                assert_eq!(segment, "nosuch");
            }
            other => panic!("expected UnresolvedAccessor, got {other:?}"),
        }
    }

    #[test]
    fn resolve_step_on_scalar_is_unresolved() {
        let obj = test_obj();
        match resolve(&obj, &parse("et().energy()").unwrap()) {
            Err(EgHltError::UnresolvedAccessor {
                type_name, segment, ..
            }) => {
                assert_eq!(type_name, "float");
                assert_eq!(segment, "energy");
            }
            other => panic!("expected UnresolvedAccessor, got {other:?}"),
        }
    }

    #[test]
    fn resolve_bad_invocation_carries_the_call() {
        let obj = test_obj();
        // var() requires a string name; a float in first position is a
        // failure of the invocation, not a missing member.
        match resolve(&obj, &parse("var(2.5)").unwrap()) {
            Err(EgHltError::Invocation { call, .. }) => {
                assert_eq!(call, "var(2.5)");
            }
            other => panic!("expected Invocation, got {other:?}"),
        }
    }

    #[test]
    fn resolve_empty_chain_is_an_error() {
        let obj = test_obj();
        assert!(resolve(&obj, &[]).is_err());
    }

    #[test]
    fn unary_func_three_ways() {
        let obj = test_obj();
        let from_chain = UnaryFunc::chain("eta()").unwrap();
        assert_relative_eq!(from_chain.eval(&obj).unwrap().as_f64().unwrap(), -0.7);

        let from_bound = UnaryFunc::bound(
            |obj: &dyn FieldAccess, args: &[ArgValue]| obj.call_method("var", args),
            vec![
                ArgValue::Str("hltEgammaHoverEUnseeded".to_string()),
                ArgValue::Int(0),
            ],
        );
        assert_relative_eq!(from_bound.eval(&obj).unwrap().as_f64().unwrap(), 0.05);

        let from_plain = UnaryFunc::plain(|obj: &dyn FieldAccess| obj.get_field("phi"));
        assert_relative_eq!(from_plain.eval(&obj).unwrap().as_f64().unwrap(), 1.2);
    }
}
