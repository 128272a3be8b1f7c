use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use ppg_vitals::config::Args;
use ppg_vitals::data_loading::{load_samples, Sample};
use ppg_vitals::{output, EngineConfig, VitalsEngine, VitalsReading};

/// Length of the trailing stretch averaged into the final blood pressure.
const FINALIZATION_SPAN_MS: u64 = 10_000;

fn load_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            EngineConfig::from_json(&json).with_context(|| format!("Invalid config file: {}", path.display()))?
        }
        None => EngineConfig::default(),
    };
    if let Some(rate) = args.sample_rate {
        config.sample_rate_hz = rate;
    }
    config.validate().context("Invalid engine configuration")?;
    Ok(config)
}

fn apply_reference_calibrations(engine: &mut VitalsEngine, args: &Args, samples: &[Sample]) {
    let window_size = engine.config().window_size;
    let reference: Vec<f64> = samples.iter().take(window_size).map(|s| s.value).collect();

    if let Some(bp) = args.bp_reference {
        match engine.set_blood_pressure_calibration(bp.high, bp.low, &reference) {
            Ok(()) => println!("Blood pressure calibrated to {}/{}", bp.high, bp.low),
            Err(e) => warn!("Blood pressure calibration skipped: {}", e),
        }
    }
    if let Some(glucose) = args.glucose_reference {
        match engine.set_glucose_calibration(glucose, &reference) {
            Ok(()) => println!("Glucose calibrated to {} mg/dL", glucose),
            Err(e) => warn!("Glucose calibration skipped: {}", e),
        }
    }
}

fn print_summary(engine: &VitalsEngine, last: Option<&VitalsReading>) {
    println!("\nSession summary:");
    println!("  Samples processed : {}", engine.samples_processed());
    match engine.get_final_bpm() {
        Some(bpm) => println!("  Final heart rate  : {:.1} bpm", bpm),
        None => println!("  Final heart rate  : --"),
    }
    if let Some(bpm) = engine.spectral_heart_rate() {
        println!("  Spectral estimate : {:.1} bpm", bpm);
    }

    let hrv = engine.hrv_metrics();
    println!(
        "  HRV               : mean RR {:.0} ms, SDNN {:.1} ms, RMSSD {:.1} ms, pNN50 {:.1}%, entropy {:.2} bits",
        hrv.mean_rr, hrv.sdnn, hrv.rmssd, hrv.pnn50, hrv.shannon_entropy
    );
    println!("  Rhythm            : {}", engine.arrhythmia_status().status_string());

    match engine.last_valid_reading().or(last) {
        Some(reading) => {
            println!(
                "  Last reading      : HR {} bpm, SpO2 {}%, BP {}, glucose {} mg/dL",
                reading.heart_rate, reading.spo2, reading.blood_pressure, reading.glucose
            );
            println!(
                "  Lipids            : cholesterol {} mg/dL, triglycerides {} mg/dL",
                reading.lipids.cholesterol, reading.lipids.triglycerides
            );
        }
        None => println!("  Last reading      : --"),
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let samples = load_samples(&args.input_path)?;
    if samples.is_empty() {
        anyhow::bail!("No samples found in {}", args.input_path.display());
    }
    println!("Loaded {} samples from {}", samples.len(), args.input_path.display());

    let mut engine = VitalsEngine::new(config)?;
    apply_reference_calibrations(&mut engine, &args, &samples);
    if args.calibrate {
        engine.start_calibration();
    }

    let last_ts = samples[samples.len() - 1].timestamp_ms;
    let finalize_from = last_ts.saturating_sub(FINALIZATION_SPAN_MS);
    let mut finalizing = false;
    let mut lipid_reference = args.lipid_reference;
    let mut readings = Vec::with_capacity(if args.csv_output.is_some() { samples.len() } else { 0 });
    let mut last_reading = None;

    for (i, sample) in samples.iter().enumerate() {
        if args.force_calibration_after == Some(i as u64) {
            info!("Forcing calibration completion at sample {}", i);
            engine.force_calibration_completion();
        }
        if args.finalize && !finalizing && sample.timestamp_ms >= finalize_from {
            engine.begin_finalization();
            finalizing = true;
        }

        let reading = engine.process(sample.value, sample.timestamp_ms);

        if let Some(lipids) = lipid_reference {
            if reading.lipids.cholesterol > 0 {
                match engine.set_lipid_calibration(lipids.high, lipids.low) {
                    Ok(()) => println!("Lipids calibrated to {}/{} at sample {}", lipids.high, lipids.low, i),
                    Err(e) => warn!("Lipid calibration skipped: {}", e),
                }
                lipid_reference = None;
            }
        }

        debug!(
            "{} ms: HR {} SpO2 {} BP {} {}",
            reading.timestamp_ms, reading.heart_rate, reading.spo2, reading.blood_pressure, reading.arrhythmia_status
        );
        if args.csv_output.is_some() {
            readings.push(reading.clone());
        }
        last_reading = Some(reading);
    }

    if lipid_reference.is_some() {
        warn!("Lipid calibration skipped: no lipid estimate was produced");
    }

    print_summary(&engine, last_reading.as_ref());

    if args.finalize {
        match engine.final_blood_pressure() {
            Some(bp) => println!("  Final BP          : {}", bp),
            None => println!("  Final BP          : -- (recording too short after finalization start)"),
        }
    }

    if let Some(path) = &args.csv_output {
        output::write_readings_to_csv(path, &readings)?;
    }

    Ok(())
}
