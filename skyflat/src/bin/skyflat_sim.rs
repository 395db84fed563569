use anyhow::Context;
use clap::Parser;
use nightshade_skyflat::coefficients::{CoefficientStore, CoefficientTable, FileCoefficientStore, SkyModelCoefficients};
use nightshade_skyflat::logging::{init_logging, log_directory};
use nightshade_skyflat::sim::{SimCamera, SimObservatory, SimSite};
use nightshade_skyflat::{AutoSkyFlat, SkyFlatConfig};
use std::path::PathBuf;
use std::sync::Arc;

/// Run one sky flat sequence against simulated instruments
#[derive(Parser, Debug)]
#[command(author, version, about = "Sky flat sequence against a simulated observatory")]
struct Args {
    /// Sky flat configuration (JSON, comments allowed); defaults otherwise
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Coefficients file; overrides the one named in the configuration
    #[arg(long)]
    coefficients: Option<PathBuf>,

    /// Filter to take flats in
    #[arg(short, long, default_value = "R")]
    filter: String,

    /// Stop after this many flats
    #[arg(short = 'n', long)]
    max_flats: Option<u32>,

    /// Solar altitude at start (degrees)
    #[arg(long, default_value_t = -6.0, allow_hyphen_values = true)]
    start_altitude: f64,

    /// Rate of solar altitude change (degrees per second), sign ignored
    #[arg(long, default_value_t = 0.01)]
    rate: f64,

    /// Simulate dawn instead of dusk
    #[arg(long)]
    dawn: bool,

    /// Real sky brightness relative to the model
    #[arg(long, default_value_t = 1.0)]
    sky_factor: f64,

    /// Per-pixel noise amplitude (ADU)
    #[arg(long, default_value_t = 50)]
    noise: i32,

    /// Also write logs to this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn builtin_coefficients() -> CoefficientTable {
    let mut table = CoefficientTable::new();
    table.insert("R", SkyModelCoefficients::new(2_000_000.0, 68.0, 17.0));
    table
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_dir.as_deref())?;

    let mut config = match &args.config {
        Some(path) => SkyFlatConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => SkyFlatConfig::default(),
    };

    let store: Arc<dyn CoefficientStore> = match (&args.coefficients, &args.config) {
        (Some(path), _) => {
            config.coefficients_file = path.clone();
            Arc::new(FileCoefficientStore::new(path))
        }
        (None, Some(_)) => Arc::new(FileCoefficientStore::new(config.coefficients_file.clone())),
        (None, None) => Arc::new(builtin_coefficients()),
    };

    let sky = store.load()?.for_filter(&args.filter)?;

    let rate = args.rate.abs();
    let site = if args.dawn {
        SimSite::dawn(args.start_altitude, rate)
    } else {
        SimSite::dusk(args.start_altitude, -rate)
    };
    let camera = SimCamera::new(site.clone(), sky)
        .with_sky_factor(args.sky_factor)
        .with_noise(args.noise);
    let observatory = SimObservatory::with_camera(site, camera);

    let flats = Arc::new(AutoSkyFlat::with_coefficient_store(config, observatory.instruments(), store));
    println!(
        "{} flats in {}: Sun {:.2}°, window {:.1}° to {:.1}°, exposures {:.1}s to {:.1}s",
        if args.dawn { "Dawn" } else { "Dusk" },
        args.filter,
        args.start_altitude,
        flats.config().sun_alt_low,
        flats.config().sun_alt_hi,
        flats.config().exptime_min,
        flats.config().exptime_max
    );
    if let Some(dir) = log_directory() {
        println!("Logging to {}", dir.display());
    }
    flats.subscribe(|flat| {
        println!(
            "flat #{:>3} {:>4} {:>8.2}s {:>8.0} ADU",
            flat.index, flat.filter, flat.exposure_time, flat.sky_level
        );
        Ok(())
    });

    let aborter = flats.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            aborter.abort().await;
        }
    });

    let outcome = flats.get_flats(&args.filter, args.max_flats).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}
