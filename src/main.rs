use emcaps::classes::ClassRegistry;
use emcaps::config::{load_config, Config, RunMode, CONFIG_PATH};
use emcaps::evaluate;
use emcaps::mask;
use emcaps::models::ModelRegistry;
use emcaps::overlay::{export_overlay, render_overlay};
use emcaps::pipeline::{RegionAnalysis, RegionAnalysisParams};
use emcaps::ground_truth;
use emcaps::segmentation::{save_probability_map, segment_with_probabilities};
use emcaps::session::Session;
use emcaps::ClassColors;
use std::env;
use std::path::{Path, PathBuf};

// Main application
fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Get command line arguments
    let args: Vec<String> = env::args().collect();

    // Config commands run before logging so `config create` works without a config
    if args.get(1).map(String::as_str) == Some("config") {
        return config_command(&args);
    }

    let config = load_config()?;
    init_logging(&config);

    // If no arguments provided, run the default mode from config
    if args.len() <= 1 {
        return run_from_config(&config);
    }

    // Handle different commands
    match args[1].as_str() {
        "analyze" => {
            if args.len() < 4 {
                println!("Usage: emcaps analyze <image> <mask> [classifier_variant]");
                return Ok(());
            }
            run_analyze(&config, &args[2], &args[3], args.get(4).map(String::as_str), None)?;
        }
        "segment" => {
            if args.len() < 3 {
                println!("Usage: emcaps segment <image> [segmenter_variant] [ground_truth]");
                return Ok(());
            }
            run_segment(
                &config,
                &args[2],
                args.get(3).map(String::as_str),
                None,
                args.get(4).map(String::as_str),
            )?;
        }
        "overlay" => {
            if args.len() < 4 {
                println!("Usage: emcaps overlay <image> <class_mask> [output]");
                return Ok(());
            }
            run_overlay(&config, &args[2], &args[3], args.get(4).map(String::as_str))?;
        }
        "evaluate" => {
            if args.len() < 3 {
                println!("Usage: emcaps evaluate <patch_directory> [classifier_variant]");
                println!("  Expects <patch_directory>/<class name>/<image number>_<name>.png");
                return Ok(());
            }
            run_evaluate(&config, &args[2], args.get(3).map(String::as_str))?;
        }
        "help" => {
            print_help();
        }
        _ => {
            println!("Unknown command: {}", args[1]);
            print_help();
        }
    }

    Ok(())
}

fn init_logging(config: &Config) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.log_level.as_str()))
        .init();
}

/// Run the appropriate mode based on configuration
fn run_from_config(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    println!("Running mode from configuration: {:?}", config.run_mode);
    let options = &config.mode_options;

    match config.run_mode {
        RunMode::Analyze => {
            let o = &options.analyze;
            require(&o.image, "mode_options.analyze.image")?;
            require(&o.mask, "mode_options.analyze.mask")?;
            run_analyze(config, &o.image, &o.mask, None, non_empty(&o.output))
        }
        RunMode::Segment => {
            let o = &options.segment;
            require(&o.image, "mode_options.segment.image")?;
            run_segment(config, &o.image, None, non_empty(&o.output), non_empty(&o.ground_truth))
        }
        RunMode::Overlay => {
            let o = &options.overlay;
            require(&o.image, "mode_options.overlay.image")?;
            require(&o.mask, "mode_options.overlay.mask")?;
            run_overlay(config, &o.image, &o.mask, non_empty(&o.output))
        }
        RunMode::Evaluate => run_evaluate(config, &options.evaluate.patch_directory, None),
    }
}

fn require(value: &str, key: &str) -> Result<(), Box<dyn std::error::Error>> {
    if value.is_empty() {
        return Err(format!("{} is not set in {}", key, CONFIG_PATH).into());
    }
    Ok(())
}

fn non_empty(value: &str) -> Option<&str> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn class_registry(config: &Config) -> Result<&'static ClassRegistry, Box<dyn std::error::Error>> {
    match ClassRegistry::global() {
        Some(registry) => Ok(registry),
        None => Ok(ClassRegistry::init_global(config.get_class_info_path())?),
    }
}

/// Region analysis of one image/mask pair
fn run_analyze(
    config: &Config,
    image_path: &str,
    mask_path: &str,
    variant: Option<&str>,
    output: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let classes = class_registry(config)?;
    let models = ModelRegistry::from_config(config);
    let mut session = Session::from_config(config);
    session.open_source(image_path);

    let image = image::open(image_path)?.to_luma8();
    let mut mask = mask::load_mask(Path::new(mask_path))?;

    let mut params = RegionAnalysisParams::from(&config.region_analysis);
    if let Some(variant) = variant {
        params.classifier_variant = variant.to_string();
    }
    params.output_path = output.map(PathBuf::from);

    println!("Analyzing {} with classifier {}", image_path, params.classifier_variant);
    let mut outcome = RegionAnalysis::new(params).run(&image, Some(&mut mask), &models, classes, &session)?;
    println!("{}", outcome.status);

    for row in outcome.report.rows() {
        println!(
            "  region {:>4}  area {:>5}  circularity {:.2}  {} ({:.2})",
            row.region_id, row.area, row.circularity, row.class_name, row.confidence
        );
    }
    if let Some(path) = &outcome.report_path {
        println!("Report saved to: {}", path.display());
    }
    if let Some(err) = &outcome.write_error {
        eprintln!("Report not saved: {}", err);
    }

    if config.region_analysis.relabel_inplace {
        if let Some(path) = outcome.write_overlay(&image, &session.default_overlay_path())? {
            println!("Overlay saved to: {}", path.display());
        }
    }

    if let Some(err) = outcome.write_error {
        return Err(err.into());
    }
    Ok(())
}

/// Segment an image, save the label mask and optionally compare it with ground truth
fn run_segment(
    config: &Config,
    image_path: &str,
    variant: Option<&str>,
    output: Option<&str>,
    ground_truth_path: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let models = ModelRegistry::from_config(config);
    let variant = variant.unwrap_or(config.segmentation.variant.as_str());
    let segmenter = models.segmenter(variant)?;

    let image = image::open(image_path)?.to_luma8();
    let segmentation = {
        let mut segmenter = segmenter.lock();
        segment_with_probabilities(&image, &mut *segmenter, &config.segmentation)?
    };

    let source = Path::new(image_path);
    let stem = source.file_stem().unwrap_or_default().to_string_lossy().to_string();
    let output_path = match output {
        Some(path) => PathBuf::from(path),
        None => source.with_file_name(format!("{}_mask.png", stem)),
    };
    let output_dir = output_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    mask::save_mask(&segmentation.mask, &output_path)?;
    println!(
        "Segmented {} with {}: {} foreground pixels",
        image_path,
        variant,
        mask::foreground_count(&segmentation.mask)
    );
    println!("Mask saved to: {}", output_path.display());

    if config.segmentation.save_probability_map {
        let prob_path = output_dir.join(format!("{}_probmap.png", stem));
        save_probability_map(&segmentation.probabilities, &prob_path)?;
        println!("Probability map saved to: {}", prob_path.display());
    }

    if let Some(truth_path) = ground_truth_path {
        let truth = mask::load_mask(Path::new(truth_path))?;
        let scores = ground_truth::evaluate_segmentation(
            &image,
            &segmentation,
            &truth,
            config.segmentation.threshold,
            &output_dir,
            &stem,
        )?;
        println!("Ground truth: {}", truth_path);
        println!("Pixel precision: {:.3}", scores.precision);
        println!("Pixel recall: {:.3}", scores.recall);
        println!("Error maps saved to: {}", output_dir.display());
    }
    Ok(())
}

/// Render a class overlay for an image and a class-labelled mask
fn run_overlay(
    config: &Config,
    image_path: &str,
    mask_path: &str,
    output: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let classes = class_registry(config)?;
    let mut session = Session::from_config(config);
    session.open_source(image_path);

    let image = image::open(image_path)?.to_luma8();
    let labels = mask::load_mask(Path::new(mask_path))?;
    let overlay = render_overlay(&image, &labels, &ClassColors::for_registry(classes))?;

    let output_path = output
        .map(PathBuf::from)
        .unwrap_or_else(|| session.default_overlay_path());
    export_overlay(&overlay, &output_path)?;
    println!("Overlay saved to: {}", output_path.display());
    Ok(())
}

/// Evaluate a patch classifier on a labelled patch directory
fn run_evaluate(
    config: &Config,
    patch_dir: &str,
    variant: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let classes = class_registry(config)?;
    let models = ModelRegistry::from_config(config);
    let variant = variant.unwrap_or(config.region_analysis.classifier_variant.as_str());
    let classifier = models.classifier(variant)?;

    let source = Path::new(patch_dir);
    let dir_name = source.file_name().unwrap_or_default().to_string_lossy();
    let output_dir = config.get_output_dir().join("evaluation").join(&*dir_name);

    println!("Evaluating classifier {} on {}", variant, source.display());
    let evaluation = {
        let mut classifier = classifier.lock();
        evaluate::run_evaluation(source, &mut *classifier, classes, config, &output_dir)?
    };

    println!("Patches: {}", evaluation.total());
    println!("Accuracy: {:.2}%", evaluation.accuracy * 100.0);
    println!("Per-image majority accuracy: {:.2}%", evaluation.image_accuracy * 100.0);
    println!("Processing time: {:?}", evaluation.processing_time);
    println!("Results saved to: {}", output_dir.display());
    Ok(())
}

fn config_command(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    if args.len() < 3 {
        println!("Usage: emcaps config <command> [args]");
        println!("Commands:");
        println!("  create - Create default configuration file");
        println!("  show   - Show current configuration");
        println!("  check  - Check configuration settings");
        println!("  set <key> <value> - Modify a configuration setting");
        return Ok(());
    }

    match args[2].as_str() {
        "create" => create_config()?,
        "show" => show_config()?,
        "check" => check_config()?,
        "set" => {
            if args.len() < 5 {
                println!("Usage: emcaps config set <key> <value>");
                return Ok(());
            }
            set_config(&args[3], &args[4])?;
        }
        _ => {
            println!("Unknown config command: {}", args[2]);
        }
    }
    Ok(())
}

/// Create default configuration file
fn create_config() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default();
    config.save_to_file(CONFIG_PATH)?;
    println!("Created default configuration file: {}", CONFIG_PATH);
    Ok(())
}

/// Show current configuration
fn show_config() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Check configuration settings and the resources they point to
fn check_config() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    let ra = &config.region_analysis;

    println!("Configuration check:");
    println!("  Output directory: {}", config.get_output_dir().display());
    match ClassRegistry::from_file(config.get_class_info_path()) {
        Ok(classes) => {
            println!("  Class info: {} ({} classes)", config.class_info_path, classes.len());
            match classes.resolve_allowed(&ra.allowed_classes) {
                Ok(ids) => println!("  Allowed class ids: {:?}", ids),
                Err(e) => println!("  Allowed classes: {}", e),
            }
        }
        Err(e) => println!("  Class info: {}", e),
    }
    for (name, entry) in &config.classifier_models {
        let status = if Path::new(&entry.path).exists() { "found" } else { "missing" };
        println!("  Classifier {}: {} ({}, input {}px)", name, entry.path, status, entry.input_size);
    }
    println!("  Segmenter: {}", config.segmentation.variant);
    println!(
        "  Region filter: area {}..={}, circularity >= {:.2}",
        ra.min_size, ra.max_size, ra.min_circularity
    );
    println!("  Out-of-set policy: {:?}", ra.out_of_set_policy);
    println!("  Shape type: {:?}", ra.shape_type);
    Ok(())
}

/// Set configuration setting
fn set_config(key: &str, value: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config()?;
    config.set(key, value)?;
    config.save_to_file(CONFIG_PATH)?;
    println!("Updated configuration saved");
    Ok(())
}

/// Print help information
fn print_help() {
    println!("emcaps - Encapsulin region analysis for EM images");
    println!();
    println!("Commands:");
    println!("  analyze <image> <mask> [variant]     - Classify the regions of a mask and write a report");
    println!("  segment <image> [variant] [truth]    - Segment an image; compare with a ground-truth mask");
    println!("  overlay <image> <class_mask> [out]   - Render a false-color class overlay");
    println!("  evaluate <patch_dir> [variant]       - Evaluate a patch classifier (confusion matrix)");
    println!("  config <subcommand>                  - Manage configuration");
    println!("  help                                 - Show this help message");
    println!();
    println!("Running without arguments:");
    println!("  The application will run according to the \"run_mode\" setting in config.json");
    println!("  All configuration for modes can be specified in the \"mode_options\" section");
    println!();
    println!("Available run_mode values:");
    println!("  - analyze");
    println!("  - segment");
    println!("  - overlay");
    println!("  - evaluate");
}
