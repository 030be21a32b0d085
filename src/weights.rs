//! Per-event Monte-Carlo normalisation weights.
//!
//! Two weighting schemes coexist. Simple samples (DY, W+jets, ...) are
//! weighted flat by name from the catalog's `{xsec, nrtot}` records. The
//! QCD/minimum-bias mixture is stitched: every recorded interaction in the
//! event (in-time pileup plus the hard scatter itself) is classified into a
//! pT-hat bin and the inclusive expectation is corrected bin by bin for the
//! double counting introduced by overlaying binned samples, with a further
//! efficiency correction for events kept by the electromagnetic generator
//! filter.
//!
//! The catalog is immutable after loading. [`EvtWeights`] carries one piece
//! of mutable state, the set of sample names already warned about; give each
//! concurrent worker its own instance rather than sharing one.

use std::fs::File;

use accurate::sum::Klein;
use accurate::traits::*;
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use serde::Deserialize;

use crate::data::{
    EventBank, GenFilterDecision, BC_TO_E_FILTER, EM_ENRICHING_FILTER, GEN_INFO, PU_SUMMARY,
};
use crate::{EgHltError, EgHltResult};

/// Effective colliding-bunch frequency (Hz) used to convert expected event
/// counts into rates.
pub const DEFAULT_BX_FREQ: f64 = 30.0e6;
/// Expected in-time pileup multiplicity of the Phase-II samples.
pub const DEFAULT_AVG_PU: f64 = 200.0;

fn one() -> f64 {
    1.0
}

/// Catalog record for a simple (non-stitched) sample.
#[derive(Debug, Clone, Deserialize)]
pub struct SampleRecord {
    /// Process cross-section
    pub xsec: f64,
    /// Total number of generated events
    pub nrtot: f64,
}

/// Catalog record for one pT-hat bin of the QCD/minbias mixture.
#[derive(Debug, Clone, Deserialize)]
pub struct QcdBinRecord {
    /// Lower pT-hat edge (GeV)
    pub min_pt: f64,
    /// Upper pT-hat edge (GeV); the last bin's edge is a sentinel, the bin
    /// itself is unbounded above
    pub max_pt: f64,
    /// Process cross-section for this bin
    pub xsec: f64,
    /// Number of inclusively generated events
    pub nr_inclusive: f64,
    /// Number of additional EM-filtered events
    #[serde(default)]
    pub nr_em: f64,
    /// EM generator-filter efficiency for this bin
    #[serde(default = "one")]
    pub em_filt_eff: f64,
}

/// The weights catalog: flat by-name records plus the QCD bin list.
///
/// The QCD records may arrive in any order; they are re-sorted ascending by
/// `min_pt` before use, after which bin 0 is the inclusive minimum-bias
/// sample.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WeightCatalog {
    /// Flat mapping from sample name to its record
    #[serde(default)]
    pub samples: IndexMap<String, SampleRecord>,
    /// QCD/minbias pT-hat bin records
    #[serde(default)]
    pub qcd: Vec<QcdBinRecord>,
}

impl WeightCatalog {
    /// Load a catalog from a JSON file, expanding `~` and `$VAR` in the path.
    pub fn from_path(path: &str) -> EgHltResult<Self> {
        let expanded = shellexpand::full(path)?;
        let file = File::open(expanded.as_ref())?;
        Ok(serde_json::from_reader(file)?)
    }

    /// Parse a catalog from JSON text.
    pub fn from_json(text: &str) -> EgHltResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// One pT-hat bin with its derived EM-correction statistics.
///
/// The derived counts are fixed at construction: `nr_em_expect` is the
/// number of EM-filter-equivalent events the bin should contain given the
/// minimum-bias cross-section ratio plus its own inclusive sample, while
/// `nr_em_actual` is what the mixture actually provides once the dedicated
/// EM-filtered sample is added.
#[derive(Debug, Clone)]
pub struct SampleBin {
    /// Lower pT-hat edge (GeV)
    pub min_pt: f64,
    /// Upper pT-hat edge (GeV); sentinel for the last bin
    pub max_pt: f64,
    /// Process cross-section for this bin
    pub xsec: f64,
    /// Number of inclusively generated events
    pub nr_inclusive: f64,
    /// Number of additional EM-filtered events
    pub nr_em: f64,
    /// EM generator-filter efficiency for this bin
    pub em_filt_eff: f64,
    nr_em_expect: f64,
    nr_em_actual: f64,
}

impl SampleBin {
    fn new(record: &QcdBinRecord, minbias: &QcdBinRecord) -> Self {
        let nr_em_expect = (minbias.nr_inclusive * record.xsec / minbias.xsec
            + record.nr_inclusive)
            * record.em_filt_eff;
        let nr_em_actual = record.nr_inclusive * record.em_filt_eff + record.nr_em;
        Self {
            min_pt: record.min_pt,
            max_pt: record.max_pt,
            xsec: record.xsec,
            nr_inclusive: record.nr_inclusive,
            nr_em: record.nr_em,
            em_filt_eff: record.em_filt_eff,
            nr_em_expect,
            nr_em_actual,
        }
    }

    /// Expected EM-filter-equivalent event count.
    pub fn nr_em_expect(&self) -> f64 {
        self.nr_em_expect
    }

    /// Available EM-filter-equivalent event count.
    pub fn nr_em_actual(&self) -> f64 {
        self.nr_em_actual
    }

    /// The EM-efficiency weight factor; 1 when the bin has no EM statistics
    /// to correct with.
    pub fn em_filt_weight(&self) -> f64 {
        if self.nr_em_actual == 0.0 {
            1.0
        } else {
            self.nr_em_expect / self.nr_em_actual
        }
    }
}

/// Stitching weight calculator for the pT-hat-binned QCD/minbias mixture.
///
/// Stateless per call: the bin catalog is fixed at construction and every
/// [`weight`](QcdWeightCalc::weight) call is independent.
#[derive(Debug, Clone)]
pub struct QcdWeightCalc {
    bins: Vec<SampleBin>,
    edges: Vec<f64>,
    bx_freq: f64,
    avg_pu: f64,
}

impl QcdWeightCalc {
    /// Build the calculator from catalog bin records.
    ///
    /// Records are sorted ascending by `min_pt`; the first bin after sorting
    /// must be the inclusive minimum-bias sample. An empty record list is a
    /// structurally invalid catalog and is fatal.
    pub fn new(records: &[QcdBinRecord], bx_freq: f64) -> EgHltResult<Self> {
        let mut records = records.to_vec();
        records.sort_by(|a, b| a.min_pt.total_cmp(&b.min_pt));
        let minbias = records
            .first()
            .cloned()
            .ok_or_else(|| EgHltError::Custom("QCD weights catalog has no bins".to_string()))?;
        let bins: Vec<SampleBin> = records
            .iter()
            .map(|record| SampleBin::new(record, &minbias))
            .collect();
        let mut edges: Vec<f64> = bins.iter().map(|bin| bin.min_pt).collect();
        edges.push(records[records.len() - 1].max_pt);
        Ok(Self {
            bins,
            edges,
            bx_freq,
            avg_pu: DEFAULT_AVG_PU,
        })
    }

    /// Build from a loaded catalog.
    pub fn from_catalog(catalog: &WeightCatalog, bx_freq: f64) -> EgHltResult<Self> {
        Self::new(&catalog.qcd, bx_freq)
    }

    /// Override the expected in-time pileup multiplicity.
    pub fn with_avg_pu(mut self, avg_pu: f64) -> Self {
        self.avg_pu = avg_pu;
        self
    }

    /// The sorted bins.
    pub fn bins(&self) -> &[SampleBin] {
        &self.bins
    }

    /// The configured bunch-crossing frequency (Hz).
    pub fn bx_freq(&self) -> f64 {
        self.bx_freq
    }

    /// The expected in-time pileup multiplicity.
    pub fn avg_pu(&self) -> f64 {
        self.avg_pu
    }

    /// Classify a pT-hat into a bin index.
    ///
    /// Right-edge-exclusive: `edges[i] <= v < edges[i+1]` lands in bin `i`.
    /// A value at or beyond the final edge folds into the first non-minbias
    /// bin; such interactions are too rare to deserve their own bin and the
    /// downstream calibrations assume this folding. A value below the first
    /// edge clamps to bin 0.
    pub fn bin_index(&self, pt_hat: f64) -> usize {
        let idx = self.edges.partition_point(|edge| *edge <= pt_hat);
        if idx == 0 {
            return 0;
        }
        let bin = idx - 1;
        if bin >= self.bins.len() {
            1.min(self.bins.len() - 1)
        } else {
            bin
        }
    }

    /// The stitching weight for one event.
    ///
    /// `pu_pt_hats` are the in-time pileup pT-hats; the hard scatter is
    /// counted as one additional interaction. For every bin above the
    /// minimum-bias reference, the observed fraction of this event's
    /// interactions is compared with the cross-section expectation and the
    /// inclusive event count is rescaled accordingly; the weight is the
    /// bunch-crossing frequency over the corrected total. When `filt` marks
    /// the event as EM-enriched (and not b/c-to-electron), the matched bin's
    /// EM-efficiency factor is applied on top.
    pub fn weight(
        &self,
        pu_pt_hats: &[f64],
        hard_pt_hat: f64,
        filt: Option<GenFilterDecision>,
    ) -> f64 {
        let mut counts = vec![0usize; self.bins.len()];
        for &pt_hat in pu_pt_hats {
            counts[self.bin_index(pt_hat)] += 1;
        }
        counts[self.bin_index(hard_pt_hat)] += 1;
        let nr_total = (pu_pt_hats.len() + 1) as f64;

        let minbias_xsec = self.bins[0].xsec;
        let mut nr_expect = 0.0;
        for (bin_nr, bin) in self.bins.iter().enumerate() {
            let prob_corr = if bin_nr == 0 {
                1.0
            } else {
                let bin_frac = counts[bin_nr] as f64 / nr_total;
                let theory_frac = bin.xsec / minbias_xsec;
                bin_frac / theory_frac
            };
            nr_expect += bin.nr_inclusive * prob_corr;
        }

        let mut weight = self.bx_freq / nr_expect;
        if let Some(filt) = filt {
            if filt.em_enriching && !filt.bc_to_e {
                weight *= self.bins[self.bin_index(hard_pt_hat)].em_filt_weight();
            }
        }
        weight
    }

    /// The stitching weight for an event bank carrying the standard
    /// `pu_sum`/`geninfo` products and generator-filter flags.
    ///
    /// Missing filter flags count as not set, so unfiltered productions need
    /// not register them.
    pub fn weight_for_event(&self, bank: &EventBank) -> EgHltResult<f64> {
        let pu_pt_hats = bank.in_time_pt_hats(PU_SUMMARY)?;
        let gen_info = bank.gen_info(GEN_INFO)?;
        let filt = GenFilterDecision {
            em_enriching: bank.flag_or(EM_ENRICHING_FILTER, false),
            bc_to_e: bank.flag_or(BC_TO_E_FILTER, false),
        };
        Ok(self.weight(&pu_pt_hats, gen_info.pt_hat, Some(filt)))
    }
}

/// Catalog-level frontend combining flat by-name weights with the QCD
/// stitching calculator.
#[derive(Debug)]
pub struct EvtWeights {
    samples: IndexMap<String, SampleRecord>,
    qcd: Option<QcdWeightCalc>,
    lumi: f64,
    warned: Mutex<IndexSet<String>>,
}

impl EvtWeights {
    /// Build from a loaded catalog; the QCD calculator is only constructed
    /// when the catalog carries QCD bins.
    pub fn new(catalog: WeightCatalog, lumi: f64, bx_freq: f64) -> EgHltResult<Self> {
        let qcd = if catalog.qcd.is_empty() {
            None
        } else {
            Some(QcdWeightCalc::new(&catalog.qcd, bx_freq)?)
        };
        Ok(Self {
            samples: catalog.samples,
            qcd,
            lumi,
            warned: Mutex::new(IndexSet::new()),
        })
    }

    /// Load the catalog from a JSON file and build.
    pub fn from_path(path: &str, lumi: f64, bx_freq: f64) -> EgHltResult<Self> {
        Self::new(WeightCatalog::from_path(path)?, lumi, bx_freq)
    }

    /// The QCD stitching calculator, when the catalog has QCD bins.
    pub fn qcd(&self) -> Option<&QcdWeightCalc> {
        self.qcd.as_ref()
    }

    /// The target luminosity applied by [`weight_from_name`](Self::weight_from_name).
    pub fn lumi(&self) -> f64 {
        self.lumi
    }

    /// The flat per-sample weight: `xsec / nrtot * lumi`.
    ///
    /// An unknown name (or a degenerate record with no generated events)
    /// yields 1.0 with a single warning per distinct name; a missing weight
    /// must not abort a batch job.
    pub fn weight_from_name(&self, name: &str) -> f64 {
        match self.samples.get(name) {
            Some(record) if record.nrtot > 0.0 => record.xsec / record.nrtot * self.lumi,
            _ => {
                self.warn_once(name);
                1.0
            }
        }
    }

    /// The stitching weight for an event bank; 1.0 when the catalog has no
    /// QCD bins.
    pub fn weight_for_event(&self, bank: &EventBank) -> EgHltResult<f64> {
        match &self.qcd {
            Some(qcd) => qcd.weight_for_event(bank),
            None => Ok(1.0),
        }
    }

    /// How many distinct unknown sample names have been seen so far.
    pub fn nr_unknown_samples(&self) -> usize {
        self.warned.lock().len()
    }

    fn warn_once(&self, name: &str) {
        let mut warned = self.warned.lock();
        if warned.insert(name.to_string()) {
            tracing::warn!(sample = name, "no usable weight entry, defaulting to 1");
        }
    }
}

/// Compensated sum of per-event weights for job summaries.
pub fn sum_of_weights(weights: &[f64]) -> f64 {
    weights.iter().copied().sum_with_accumulator::<Klein<_>>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{EventAux, GenInfo, PileupSummary, Product};
    use approx::assert_relative_eq;
    use std::sync::Arc;

    fn bin(min_pt: f64, max_pt: f64, xsec: f64, nr_inclusive: f64) -> QcdBinRecord {
        QcdBinRecord {
            min_pt,
            max_pt,
            xsec,
            nr_inclusive,
            nr_em: 0.0,
            em_filt_eff: 1.0,
        }
    }

    fn three_bin_calc() -> QcdWeightCalc {
        let mut em_bin = bin(15.0, 30.0, 1.0e9, 500.0);
        em_bin.nr_em = 100.0;
        em_bin.em_filt_eff = 0.1;
        QcdWeightCalc::new(
            &[
                bin(0.0, 9999.0, 80.0e9, 1000.0),
                em_bin,
                bin(30.0, 9999.0, 1.0e8, 200.0),
            ],
            DEFAULT_BX_FREQ,
        )
        .unwrap()
    }

    #[test]
    fn bins_are_sorted_on_construction() {
        let calc = QcdWeightCalc::new(
            &[
                bin(30.0, 9999.0, 1.0e8, 200.0),
                bin(0.0, 9999.0, 80.0e9, 1000.0),
                bin(15.0, 30.0, 1.0e9, 500.0),
            ],
            DEFAULT_BX_FREQ,
        )
        .unwrap();
        let min_pts: Vec<f64> = calc.bins().iter().map(|b| b.min_pt).collect();
        assert_eq!(min_pts, vec![0.0, 15.0, 30.0]);
    }

    #[test]
    fn empty_catalog_is_fatal() {
        assert!(QcdWeightCalc::new(&[], DEFAULT_BX_FREQ).is_err());
    }

    #[test]
    fn bin_edges_are_left_inclusive() {
        let calc = three_bin_calc();
        assert_eq!(calc.bin_index(0.0), 0);
        assert_eq!(calc.bin_index(14.999), 0);
        assert_eq!(calc.bin_index(15.0), 1);
        assert_eq!(calc.bin_index(30.0), 2);
        assert_eq!(calc.bin_index(5000.0), 2);
    }

    #[test]
    fn overflow_folds_into_bin_one() {
        let calc = three_bin_calc();
        // At or beyond the final edge the interaction counts as soft QCD
        // rather than landing in the hardest bin.
        assert_eq!(calc.bin_index(9999.0), 1);
        assert_eq!(calc.bin_index(2.0e4), 1);
    }

    #[test]
    fn single_bin_weight_is_frequency_over_count() {
        let calc = QcdWeightCalc::new(&[bin(0.0, 9999.0, 80.0e9, 2500.0)], DEFAULT_BX_FREQ).unwrap();
        let expected = DEFAULT_BX_FREQ / 2500.0;
        assert_relative_eq!(calc.weight(&[], 5.0, None), expected);
        assert_relative_eq!(calc.weight(&[1.0, 2.0, 3.0], 50.0, None), expected);
        // Even overflow values cannot change a single-bin mixture.
        assert_relative_eq!(calc.weight(&[1.0e5], 2.0e4, None), expected);
    }

    #[test]
    fn weight_matches_hand_computed_mixture() {
        let calc = three_bin_calc();
        let weight = calc.weight(&[5.0, 20.0], 40.0, None);
        let expected = DEFAULT_BX_FREQ
            / (1000.0
                + 500.0 * ((1.0 / 3.0) / (1.0e9 / 80.0e9))
                + 200.0 * ((1.0 / 3.0) / (1.0e8 / 80.0e9)));
        assert_relative_eq!(weight, expected, max_relative = 1e-12);
    }

    #[test]
    fn weight_is_order_independent() {
        let calc = three_bin_calc();
        let pt_hats = [3.0, 18.0, 44.0, 7.5, 21.0, 8.1];
        let mut reversed = pt_hats;
        reversed.reverse();
        assert_relative_eq!(
            calc.weight(&pt_hats, 12.0, None),
            calc.weight(&reversed, 12.0, None),
        );
    }

    #[test]
    fn em_filter_correction_applies_to_the_hard_scatter_bin() {
        let calc = three_bin_calc();
        let flagged = GenFilterDecision {
            em_enriching: true,
            bc_to_e: false,
        };
        let base = calc.weight(&[5.0], 20.0, None);
        let corrected = calc.weight(&[5.0], 20.0, Some(flagged));
        // expect = (1000 * 1e9/80e9 + 500) * 0.1, actual = 500 * 0.1 + 100
        let factor = (1000.0 * (1.0e9 / 80.0e9) + 500.0) * 0.1 / 150.0;
        assert_relative_eq!(corrected, base * factor, max_relative = 1e-12);

        // b/c-to-electron events are handled by their own sample, so the
        // correction must not double up.
        let bc = GenFilterDecision {
            em_enriching: true,
            bc_to_e: true,
        };
        assert_relative_eq!(calc.weight(&[5.0], 20.0, Some(bc)), base);
    }

    #[test]
    fn em_correction_with_no_statistics_clamps_to_one() {
        let mut dead_bin = bin(15.0, 30.0, 1.0e9, 0.0);
        dead_bin.em_filt_eff = 0.1;
        let calc = QcdWeightCalc::new(
            &[bin(0.0, 9999.0, 80.0e9, 1000.0), dead_bin],
            DEFAULT_BX_FREQ,
        )
        .unwrap();
        let flagged = GenFilterDecision {
            em_enriching: true,
            bc_to_e: false,
        };
        assert_relative_eq!(
            calc.weight(&[2.0], 20.0, Some(flagged)),
            calc.weight(&[2.0], 20.0, None),
        );
    }

    #[test]
    fn weight_for_event_reads_in_time_pileup_only() {
        let calc = three_bin_calc();
        let mut bank = EventBank::new(EventAux::default());
        bank.add(
            PU_SUMMARY,
            Product::PileupSummaries(vec![
                PileupSummary {
                    bunch_crossing: -1,
                    pt_hats: vec![120.0, 88.0],
                },
                PileupSummary {
                    bunch_crossing: 0,
                    pt_hats: vec![5.0, 20.0],
                },
            ]),
        );
        bank.add(GEN_INFO, Product::GenEventInfo(Arc::new(GenInfo { pt_hat: 40.0 })));
        let from_bank = calc.weight_for_event(&bank).unwrap();
        let direct = calc.weight(&[5.0, 20.0], 40.0, Some(GenFilterDecision::default()));
        assert_relative_eq!(from_bank, direct);
    }

    #[test]
    fn unknown_sample_warns_once_and_defaults_to_one() {
        let catalog = WeightCatalog::from_json(
            r#"{
                "samples": {
                    "DYToLL_M-50_TuneCP5_14TeV-pythia8": {"xsec": 5795.0, "nrtot": 1.0e6}
                },
                "qcd": []
            }"#,
        )
        .unwrap();
        let weights = EvtWeights::new(catalog, 2.0e34, DEFAULT_BX_FREQ).unwrap();
        assert_relative_eq!(
            weights.weight_from_name("DYToLL_M-50_TuneCP5_14TeV-pythia8"),
            5795.0 / 1.0e6 * 2.0e34
        );
        assert_eq!(weights.nr_unknown_samples(), 0);
        assert_relative_eq!(weights.weight_from_name("Unknown"), 1.0);
        assert_eq!(weights.nr_unknown_samples(), 1);
        assert_relative_eq!(weights.weight_from_name("Unknown"), 1.0);
        assert_eq!(weights.nr_unknown_samples(), 1);
        assert_relative_eq!(weights.weight_from_name("AlsoUnknown"), 1.0);
        assert_eq!(weights.nr_unknown_samples(), 2);
    }

    #[test]
    fn degenerate_record_degrades_like_an_unknown_name() {
        let catalog = WeightCatalog::from_json(
            r#"{"samples": {"Empty": {"xsec": 10.0, "nrtot": 0.0}}, "qcd": []}"#,
        )
        .unwrap();
        let weights = EvtWeights::new(catalog, 1.0, DEFAULT_BX_FREQ).unwrap();
        assert_relative_eq!(weights.weight_from_name("Empty"), 1.0);
        assert_eq!(weights.nr_unknown_samples(), 1);
    }

    #[test]
    fn catalog_json_round_trip_from_file() {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("test_data")
            .join("weights_qcd.json");
        let catalog =
            WeightCatalog::from_path(path.to_str().expect("test data path is valid UTF-8"))
                .unwrap();
        let weights = EvtWeights::new(catalog, 1.0, DEFAULT_BX_FREQ).unwrap();
        let qcd = weights.qcd().expect("catalog carries QCD bins");
        assert_eq!(qcd.bins().len(), 11);
        assert_relative_eq!(qcd.bins()[0].min_pt, 0.0);
        assert_relative_eq!(qcd.bins()[0].xsec, 80.0e9);
        assert_relative_eq!(qcd.bins()[1].min_pt, 15.0);
        // catalog arrives unsorted on purpose
        assert_relative_eq!(qcd.bins()[10].min_pt, 600.0);
    }

    #[test]
    fn compensated_weight_sum() {
        let weights = vec![1.0e12, 1.0, -1.0e12, 1.0];
        assert_relative_eq!(sum_of_weights(&weights), 2.0);
    }
}
