//! Validates a QCD/minbias stitching-weight catalog on a toy pileup sample.
//!
//! Generates reproducible events (a hard scatter plus in-time pileup drawn
//! from a steeply falling pT-hat spectrum), weights each one through the
//! catalog, and writes a flat Parquet ntuple of the per-event weights and
//! pT-hat profile for downstream inspection.

use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use eghlt::data::{EventAux, EventBank, GenInfo, PileupSummary, Product, GEN_INFO, PU_SUMMARY};
use eghlt::ntuple::{ColumnType, FlatNtuple};
use eghlt::weights::{sum_of_weights, EvtWeights, DEFAULT_BX_FREQ};

#[derive(Parser)]
#[command(about = "check QCD/minbias pileup stitching weights on a toy sample")]
struct Cli {
    /// Weights catalog (JSON)
    weights: String,
    /// Number of toy events to generate
    #[arg(long, default_value_t = 10_000)]
    nr_events: u64,
    /// Random seed
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// Bunch-crossing frequency in Hz
    #[arg(long, default_value_t = DEFAULT_BX_FREQ)]
    bx_freq: f64,
    /// Target luminosity for flat by-name weights
    #[arg(long, default_value_t = 1.0)]
    lumi: f64,
    /// Output ntuple
    #[arg(long, short, default_value = "pu_weights.parquet")]
    out: String,
    /// Enable debug logging
    #[arg(long, short)]
    verbose: bool,
}

/// Draw one pT-hat from an approximate soft-QCD spectrum, falling steeply
/// above 2 GeV.
fn sample_pt_hat<R: Rng>(rng: &mut R) -> f64 {
    let u: f64 = rng.gen_range(1.0e-12..1.0);
    2.0 * u.powf(-0.25)
}

fn make_toy_event<R: Rng>(rng: &mut R, event_nr: u64, avg_pu: f64) -> EventBank {
    let mut bank = EventBank::new(EventAux {
        run: 1,
        lumi_sec: 1,
        event_nr,
    });
    let nr_pu = rng.gen_range((avg_pu * 0.5) as usize..=(avg_pu * 1.5) as usize);
    let in_time: Vec<f64> = (0..nr_pu).map(|_| sample_pt_hat(rng)).collect();
    let out_of_time: Vec<f64> = (0..nr_pu).map(|_| sample_pt_hat(rng)).collect();
    bank.add(
        PU_SUMMARY,
        Product::PileupSummaries(vec![
            PileupSummary {
                bunch_crossing: 0,
                pt_hats: in_time,
            },
            // out-of-time crossings ride along but never enter the weight
            PileupSummary {
                bunch_crossing: 1,
                pt_hats: out_of_time,
            },
        ]),
    );
    bank.add(
        GEN_INFO,
        Product::GenEventInfo(std::sync::Arc::new(GenInfo {
            pt_hat: sample_pt_hat(rng),
        })),
    );
    bank
}

fn book_ntuple() -> Result<FlatNtuple> {
    let mut ntuple = FlatNtuple::new();
    ntuple.add_chain_column("eventnr", ColumnType::I64, "eventAuxiliary().event()")?;
    ntuple.add_chain_column("weight", ColumnType::F64, "weight")?;
    ntuple.add_chain_column("hardPtHat", ColumnType::F64, "hardPtHat")?;
    ntuple.add_chain_column("maxPtHat", ColumnType::F64, "maxPtHat")?;
    ntuple.add_chain_column("nrPU", ColumnType::I64, "nrPU")?;
    Ok(ntuple)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    let weights = EvtWeights::from_path(&cli.weights, cli.lumi, cli.bx_freq)
        .with_context(|| format!("loading weights catalog {}", cli.weights))?;
    let Some(qcd) = weights.qcd() else {
        bail!("catalog {} has no QCD bins to check", cli.weights);
    };
    tracing::info!(
        bins = qcd.bins().len(),
        bx_freq = qcd.bx_freq(),
        "weights catalog loaded"
    );

    let mut rng = ChaCha8Rng::seed_from_u64(cli.seed);
    let mut ntuple = book_ntuple()?;
    let mut event_weights = Vec::with_capacity(cli.nr_events as usize);

    for event_nr in 0..cli.nr_events {
        let mut bank = make_toy_event(&mut rng, event_nr, qcd.avg_pu());
        let weight = weights
            .weight_for_event(&bank)
            .context("weighting toy event")?;

        let in_time = bank.in_time_pt_hats(PU_SUMMARY)?;
        let hard_pt_hat = bank.gen_info(GEN_INFO)?.pt_hat;
        let max_pt_hat = in_time
            .iter()
            .copied()
            .fold(hard_pt_hat, f64::max);
        bank.add("weight", Product::Scalar(weight));
        bank.add("hardPtHat", Product::Scalar(hard_pt_hat));
        bank.add("maxPtHat", Product::Scalar(max_pt_hat));
        bank.add("nrPU", Product::Int(in_time.len() as i64));

        ntuple.fill(&bank).context("filling ntuple")?;
        event_weights.push(weight);

        if event_nr % 1000 == 0 {
            tracing::debug!(event_nr, weight, "processed");
        }
    }

    let total = sum_of_weights(&event_weights);
    tracing::info!(
        events = cli.nr_events,
        sum_weights = total,
        mean_weight = total / cli.nr_events as f64,
        "toy sample weighted"
    );

    ntuple
        .write_parquet(&cli.out)
        .with_context(|| format!("writing {}", cli.out))?;
    tracing::info!(out = %cli.out, rows = ntuple.n_rows(), "ntuple written");
    Ok(())
}
