//! Named per-event products and the physics-object adapters they hold.
//!
//! [`EventBank`] plays the role of the upstream framework's per-event product
//! registry: driver code registers whatever the job needs under a logical
//! name (trigger candidates, generator particles, pileup summaries, filter
//! decisions) and everything downstream retrieves by that name. The bank and
//! the objects inside it implement [`FieldAccess`], which is what lets
//! accessor chains like `eventAuxiliary().run()` or `var("hltEgammaHoverE",0)`
//! drive ntuple columns without per-field code.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::accessor::{ArgValue, FieldAccess, FieldValue};
use crate::{EgHltError, EgHltResult};

/// Product name conventionally used for the pileup summaries.
pub const PU_SUMMARY: &str = "pu_sum";
/// Product name conventionally used for the generator event info.
pub const GEN_INFO: &str = "geninfo";
/// Generator-filter path flagging electromagnetically enriched events.
pub const EM_ENRICHING_FILTER: &str = "Gen_QCDEmEnrichingFilter";
/// Generator-filter path flagging b/c-hadron-to-electron events.
pub const BC_TO_E_FILTER: &str = "Gen_QCDBCToEFilter";

/// An e/gamma trigger candidate with its named working-point variables.
///
/// The kinematics are fixed fields; everything the trigger computed for the
/// candidate (shower shapes, isolations, track match quality) lives in the
/// name-keyed variable map and is read back with [`var`](EgTrigObj::var).
#[derive(Debug, Clone, Default)]
pub struct EgTrigObj {
    /// Transverse energy (GeV)
    pub et: f64,
    /// Total energy (GeV)
    pub energy: f64,
    /// Pseudorapidity
    pub eta: f64,
    /// Azimuthal angle
    pub phi: f64,
    vars: IndexMap<String, f64>,
}

impl EgTrigObj {
    /// Create a candidate from its kinematics.
    pub fn new(et: f64, energy: f64, eta: f64, phi: f64) -> Self {
        Self {
            et,
            energy,
            eta,
            phi,
            ..Default::default()
        }
    }

    /// Set (or overwrite) a named variable.
    pub fn set_var(&mut self, name: impl Into<String>, value: f64) {
        self.vars.insert(name.into(), value);
    }

    /// Look up a named variable, falling back to `default` when absent.
    pub fn var(&self, name: &str, default: f64) -> f64 {
        self.vars.get(name).copied().unwrap_or(default)
    }

    /// Iterate over the names of the stored variables.
    pub fn var_names(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }
}

impl FieldAccess for EgTrigObj {
    fn type_name(&self) -> &'static str {
        "EgTrigObj"
    }

    fn get_field(&self, name: &str) -> EgHltResult<FieldValue> {
        match name {
            "et" => Ok(FieldValue::Float(self.et)),
            "energy" => Ok(FieldValue::Float(self.energy)),
            "eta" => Ok(FieldValue::Float(self.eta)),
            "phi" => Ok(FieldValue::Float(self.phi)),
            _ => Err(self.no_such_member(name)),
        }
    }

    fn call_method(&self, name: &str, args: &[ArgValue]) -> EgHltResult<FieldValue> {
        match name {
            "et" | "energy" | "eta" | "phi" if args.is_empty() => self.get_field(name),
            "var" => match args {
                [ArgValue::Str(var_name)] => Ok(FieldValue::Float(self.var(var_name, 0.0))),
                [ArgValue::Str(var_name), default] => {
                    let default = default.as_f64().ok_or_else(|| {
                        EgHltError::Custom(format!(
                            "default for var \"{var_name}\" must be numeric"
                        ))
                    })?;
                    Ok(FieldValue::Float(self.var(var_name, default)))
                }
                _ => Err(EgHltError::Custom(
                    "var expects a quoted variable name and an optional numeric default"
                        .to_string(),
                )),
            },
            _ => Err(self.no_such_member(name)),
        }
    }
}

/// A generator-level particle.
#[derive(Debug, Clone)]
pub struct GenParticle {
    /// Transverse momentum (GeV)
    pub pt: f64,
    /// Pseudorapidity
    pub eta: f64,
    /// Azimuthal angle
    pub phi: f64,
    /// Production vertex z (cm)
    pub vz: f64,
    /// PDG particle id
    pub pdg_id: i32,
    /// Generator status code (1 = final state)
    pub status: i32,
}

impl FieldAccess for GenParticle {
    fn type_name(&self) -> &'static str {
        "GenParticle"
    }

    fn get_field(&self, name: &str) -> EgHltResult<FieldValue> {
        match name {
            "pt" => Ok(FieldValue::Float(self.pt)),
            "eta" => Ok(FieldValue::Float(self.eta)),
            "phi" => Ok(FieldValue::Float(self.phi)),
            "vz" => Ok(FieldValue::Float(self.vz)),
            "pdgId" => Ok(FieldValue::Int(self.pdg_id as i64)),
            "status" => Ok(FieldValue::Int(self.status as i64)),
            _ => Err(self.no_such_member(name)),
        }
    }

    fn call_method(&self, name: &str, args: &[ArgValue]) -> EgHltResult<FieldValue> {
        if args.is_empty() {
            self.get_field(name)
        } else {
            Err(self.no_such_member(name))
        }
    }
}

/// The superimposed interactions recorded for one bunch crossing.
#[derive(Debug, Clone, Default)]
pub struct PileupSummary {
    /// Bunch crossing offset; 0 is in-time pileup
    pub bunch_crossing: i32,
    /// pT-hat of every overlaid interaction in this crossing
    pub pt_hats: Vec<f64>,
}

/// Generator-filter decisions relevant to the EM-efficiency correction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenFilterDecision {
    /// Event passed the EM-enriching generator filter
    pub em_enriching: bool,
    /// Event passed the b/c-to-electron generator filter
    pub bc_to_e: bool,
}

/// Generator-level event information.
#[derive(Debug, Clone, Default)]
pub struct GenInfo {
    /// Momentum-transfer scale of the hard scatter (qScale)
    pub pt_hat: f64,
}

/// Run/lumi/event identification, reachable through `eventAuxiliary()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventAux {
    /// Run number
    pub run: u32,
    /// Luminosity section
    pub lumi_sec: u32,
    /// Event number within the run
    pub event_nr: u64,
}

impl FieldAccess for EventAux {
    fn type_name(&self) -> &'static str {
        "EventAux"
    }

    fn get_field(&self, name: &str) -> EgHltResult<FieldValue> {
        match name {
            "run" => Ok(FieldValue::Int(i64::from(self.run))),
            "luminosityBlock" => Ok(FieldValue::Int(i64::from(self.lumi_sec))),
            "event" => Ok(FieldValue::Int(self.event_nr as i64)),
            _ => Err(self.no_such_member(name)),
        }
    }

    fn call_method(&self, name: &str, args: &[ArgValue]) -> EgHltResult<FieldValue> {
        if args.is_empty() {
            self.get_field(name)
        } else {
            Err(self.no_such_member(name))
        }
    }
}

/// One per-event payload stored under a logical name.
#[derive(Debug, Clone)]
pub enum Product {
    /// A list of floats (e.g. raw pT-hats)
    Floats(Vec<f64>),
    /// A single float
    Scalar(f64),
    /// A single integer (e.g. an object count)
    Int(i64),
    /// A single boolean (e.g. a trigger or generator-filter decision)
    Flag(bool),
    /// E/gamma trigger candidates
    EgObjs(Vec<Arc<EgTrigObj>>),
    /// Generator particles
    GenParts(Vec<Arc<GenParticle>>),
    /// Pileup summaries, one per recorded bunch crossing
    PileupSummaries(Vec<PileupSummary>),
    /// Generator event info
    GenEventInfo(Arc<GenInfo>),
}

impl Product {
    fn kind(&self) -> &'static str {
        match self {
            Product::Floats(_) => "floats",
            Product::Scalar(_) => "scalar",
            Product::Int(_) => "int",
            Product::Flag(_) => "flag",
            Product::EgObjs(_) => "eg objects",
            Product::GenParts(_) => "gen particles",
            Product::PileupSummaries(_) => "pileup summaries",
            Product::GenEventInfo(_) => "gen event info",
        }
    }
}

/// The per-event bank of named products.
///
/// Construct once per event, register products under the names the job's
/// bindings expect, and hand it to the weight engine and the ntuple filler.
#[derive(Debug, Clone, Default)]
pub struct EventBank {
    aux: Arc<EventAux>,
    products: IndexMap<String, Product>,
}

impl EventBank {
    /// Create a bank for the event identified by `aux`.
    pub fn new(aux: EventAux) -> Self {
        Self {
            aux: Arc::new(aux),
            products: IndexMap::new(),
        }
    }

    /// The event identification block.
    pub fn aux(&self) -> &EventAux {
        &self.aux
    }

    /// Register a product, replacing any previous product of the same name.
    pub fn add(&mut self, name: impl Into<String>, product: Product) {
        self.products.insert(name.into(), product);
    }

    /// Retrieve a product by name.
    pub fn get(&self, name: &str) -> Option<&Product> {
        self.products.get(name)
    }

    fn product(&self, name: &str) -> EgHltResult<&Product> {
        self.products
            .get(name)
            .ok_or_else(|| EgHltError::MissingProduct {
                name: name.to_string(),
            })
    }

    fn wrong_kind(name: &str, expected: &'static str) -> EgHltError {
        EgHltError::ProductType {
            name: name.to_string(),
            expected,
        }
    }

    /// The float list registered under `name`.
    pub fn floats(&self, name: &str) -> EgHltResult<&[f64]> {
        match self.product(name)? {
            Product::Floats(values) => Ok(values),
            _ => Err(Self::wrong_kind(name, "floats")),
        }
    }

    /// The flag registered under `name`.
    pub fn flag(&self, name: &str) -> EgHltResult<bool> {
        match self.product(name)? {
            Product::Flag(value) => Ok(*value),
            _ => Err(Self::wrong_kind(name, "flag")),
        }
    }

    /// The flag registered under `name`, or `default` when absent.
    pub fn flag_or(&self, name: &str, default: bool) -> bool {
        match self.get(name) {
            Some(Product::Flag(value)) => *value,
            _ => default,
        }
    }

    /// The e/gamma trigger candidates registered under `name`.
    pub fn eg_objs(&self, name: &str) -> EgHltResult<&[Arc<EgTrigObj>]> {
        match self.product(name)? {
            Product::EgObjs(objs) => Ok(objs),
            _ => Err(Self::wrong_kind(name, "eg objects")),
        }
    }

    /// The generator particles registered under `name`.
    pub fn gen_parts(&self, name: &str) -> EgHltResult<&[Arc<GenParticle>]> {
        match self.product(name)? {
            Product::GenParts(parts) => Ok(parts),
            _ => Err(Self::wrong_kind(name, "gen particles")),
        }
    }

    /// The pileup summaries registered under `name`.
    pub fn pileup(&self, name: &str) -> EgHltResult<&[PileupSummary]> {
        match self.product(name)? {
            Product::PileupSummaries(summaries) => Ok(summaries),
            _ => Err(Self::wrong_kind(name, "pileup summaries")),
        }
    }

    /// The generator event info registered under `name`.
    pub fn gen_info(&self, name: &str) -> EgHltResult<&GenInfo> {
        match self.product(name)? {
            Product::GenEventInfo(info) => Ok(info),
            _ => Err(Self::wrong_kind(name, "gen event info")),
        }
    }

    /// The pT-hats of every in-time (bunch crossing 0) pileup interaction.
    pub fn in_time_pt_hats(&self, name: &str) -> EgHltResult<Vec<f64>> {
        Ok(self
            .pileup(name)?
            .iter()
            .filter(|summary| summary.bunch_crossing == 0)
            .flat_map(|summary| summary.pt_hats.iter().copied())
            .collect())
    }
}

impl FieldAccess for EventBank {
    fn type_name(&self) -> &'static str {
        "EventBank"
    }

    fn get_field(&self, name: &str) -> EgHltResult<FieldValue> {
        match self.get(name) {
            Some(Product::Scalar(value)) => Ok(FieldValue::Float(*value)),
            Some(Product::Int(value)) => Ok(FieldValue::Int(*value)),
            Some(Product::Flag(value)) => Ok(FieldValue::Bool(*value)),
            Some(product) => Err(EgHltError::Custom(format!(
                "Product \"{name}\" holds {} and cannot be read as a scalar",
                product.kind()
            ))),
            None => Err(self.no_such_member(name)),
        }
    }

    fn call_method(&self, name: &str, args: &[ArgValue]) -> EgHltResult<FieldValue> {
        match name {
            "eventAuxiliary" if args.is_empty() => {
                Ok(FieldValue::Object(self.aux.clone() as Arc<dyn FieldAccess>))
            }
            _ if args.is_empty() => self.get_field(name),
            _ => Err(self.no_such_member(name)),
        }
    }
}

/// Difference of two azimuthal angles, wrapped to `[-pi, pi]`.
pub fn delta_phi(phi1: f64, phi2: f64) -> f64 {
    let mut dphi = phi1 - phi2;
    while dphi > std::f64::consts::PI {
        dphi -= 2.0 * std::f64::consts::PI;
    }
    while dphi < -std::f64::consts::PI {
        dphi += 2.0 * std::f64::consts::PI;
    }
    dphi
}

/// Squared eta-phi cone distance.
pub fn delta_r2(eta1: f64, phi1: f64, eta2: f64, phi2: f64) -> f64 {
    let deta = eta1 - eta2;
    let dphi = delta_phi(phi1, phi2);
    deta * deta + dphi * dphi
}

/// Match a direction to the closest final-state generator particle of the
/// given species (particle and antiparticle) within `max_dr`.
///
/// Returns the match and its squared cone distance.
pub fn match_to_gen(
    eta: f64,
    phi: f64,
    genparts: &[Arc<GenParticle>],
    pid: i32,
    max_dr: f64,
) -> Option<(&Arc<GenParticle>, f64)> {
    let mut best: Option<(&Arc<GenParticle>, f64)> = None;
    let mut best_dr2 = max_dr * max_dr;
    for part in genparts {
        if part.pdg_id.abs() != pid.abs() || part.status != 1 {
            continue;
        }
        let dr2 = delta_r2(eta, phi, part.eta, part.phi);
        if dr2 < best_dr2 {
            best = Some((part, dr2));
            best_dr2 = dr2;
        }
    }
    best
}

/// All trigger candidates within `max_dr` of a direction.
pub fn match_trig_objs(
    eta: f64,
    phi: f64,
    trig_objs: &[Arc<EgTrigObj>],
    max_dr: f64,
) -> Vec<Arc<EgTrigObj>> {
    let max_dr2 = max_dr * max_dr;
    trig_objs
        .iter()
        .filter(|obj| delta_r2(eta, phi, obj.eta, obj.phi) < max_dr2)
        .cloned()
        .collect()
}
