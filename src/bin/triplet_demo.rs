use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::env;
use std::path::Path;
use warpc::config::{load_config, TripletDemoConfig};
use warpc::diagnostics::{StageClock, TimingBreakdown};
use warpc::error::Result;
use warpc::image::io::{load_rgb_image, save_mask, save_rgb_sample, write_json_file};
use warpc::{PairBatch, TripletSource};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TripletSummary {
    input_size: (usize, usize),
    output_size: (usize, usize),
    seed: u64,
    mean_flow_magnitude: f32,
    max_flow_magnitude: f32,
    valid_correspondence_fraction: f32,
    zero_border_valid_fraction: Option<f32>,
    timing: TimingBreakdown,
}

fn main() {
    let Some(config_path) = env::args().nth(1) else {
        eprintln!("Usage: triplet_demo <config.json>");
        std::process::exit(2);
    };
    if let Err(err) = run(Path::new(&config_path)) {
        eprintln!("Error ({config_path}): {err}");
        std::process::exit(1);
    }
}

fn run(config_path: &Path) -> Result<()> {
    let config: TripletDemoConfig = load_config(config_path)?;
    let mut clock = StageClock::start();
    let mut timing = TimingBreakdown::default();

    let source = load_rgb_image(&config.source)?;
    let target = load_rgb_image(&config.target)?;
    let input_size = (target.h, target.w);
    let pair = PairBatch::new(source, target)?;
    clock.lap(&mut timing, "load");

    let builder = config.training.triplet_source()?;
    let mut rng = StdRng::seed_from_u64(config.training.seed);
    let triplet = builder.build(&pair, &mut rng, true)?;
    clock.lap(&mut timing, "triplet");

    let out = &config.output;
    save_rgb_sample(&triplet.source_image, 0, &out.source_image)?;
    save_rgb_sample(&triplet.target_image, 0, &out.target_image)?;
    save_rgb_sample(triplet.target_image_prime(), 0, &out.target_prime_image)?;
    save_mask(&triplet.synthetic.correspondence_mask, 0, &out.correspondence_mask)?;
    if let (Some(path), Some(mask)) = (&out.zero_border_mask, &triplet.synthetic.mask_zero_borders) {
        save_mask(mask, 0, path)?;
    }

    let magnitudes: Vec<f32> = triplet
        .flow_map()
        .magnitude_sq()
        .data
        .iter()
        .map(|m| m.sqrt())
        .collect();
    let mean_flow_magnitude = magnitudes.iter().sum::<f32>() / magnitudes.len().max(1) as f32;
    let max_flow_magnitude = magnitudes.iter().copied().fold(0.0, f32::max);
    clock.lap(&mut timing, "save");
    timing.total_ms = clock.total_ms();

    let summary = TripletSummary {
        input_size,
        output_size: triplet.flow_map().dims(),
        seed: config.training.seed,
        mean_flow_magnitude,
        max_flow_magnitude,
        valid_correspondence_fraction: triplet.synthetic.correspondence_mask.total_fraction(),
        zero_border_valid_fraction: triplet.synthetic.mask_zero_borders.as_ref().map(|m| m.total_fraction()),
        timing,
    };
    write_json_file(&out.summary_json, &summary)?;
    println!(
        "triplet {:?} -> {:?}, mean |flow| = {:.2} px, valid = {:.3}",
        summary.input_size, summary.output_size, summary.mean_flow_magnitude, summary.valid_correspondence_fraction
    );
    Ok(())
}
