#[macro_use]
extern crate log;

use std::path::Path;
use std::process;
use std::time::Instant;

use clap::{crate_version, Arg, Command};
use dream_core::dream::DEFAULT_REPORT_INTERVAL;
use dream_core::internal::*;

use crate::params::Parameters;
use crate::render::{read_image_tensor, write_image_tensor, CheckpointReporter};

mod params;
mod render;

pub(crate) fn command() -> Command<'static> {
    Command::new("dream")
        .version(crate_version!())
        .about("Deep dream on pre-trained caffe2 image classifiers")
        .arg(
            Arg::new("model")
                .long("model")
                .takes_value(true)
                .default_value("alexnet")
                .help("Name of one of the pre-trained models"),
        )
        .arg(
            Arg::new("models_dir")
                .long("models-dir")
                .takes_value(true)
                .default_value("res")
                .help("Directory holding <model>_init_net.pb and <model>_predict_net.pb"),
        )
        .arg(
            Arg::new("layer")
                .long("layer")
                .takes_value(true)
                .default_value("pool5")
                .help("Name of the layer on which to split the model"),
        )
        .arg(
            Arg::new("channel")
                .long("channel")
                .takes_value(true)
                .default_value("3")
                .help("Channel of the layer to excite"),
        )
        .arg(
            Arg::new("objective")
                .long("objective")
                .takes_value(true)
                .default_value("channel")
                .help("What to maximize: a layer channel, or the label class"),
        )
        .arg(
            Arg::new("image")
                .short('i')
                .long("image")
                .takes_value(true)
                .help("Start from this image instead of noise"),
        )
        .arg(
            Arg::new("label")
                .long("label")
                .takes_value(true)
                .default_value("Chihuahua")
                .help("What we're dreaming about"),
        )
        .arg(
            Arg::new("labels")
                .long("labels")
                .takes_value(true)
                .default_value("res/imagenet_classes.txt")
                .help("Class names of the model, one per line"),
        )
        .arg(
            Arg::new("iterations")
                .short('n')
                .long("iterations")
                .takes_value(true)
                .help("Number of predict runs [default: 200, times 10 on an accelerator]"),
        )
        .arg(
            Arg::new("size")
                .long("size")
                .takes_value(true)
                .default_value("224")
                .help("Side of the square input image"),
        )
        .arg(
            Arg::new("learning_rate")
                .long("learning-rate")
                .takes_value(true)
                .default_value("1000")
                .help("Base learning rate"),
        )
        .arg(
            Arg::new("gamma")
                .long("gamma")
                .takes_value(true)
                .default_value("0.999")
                .help("Exponential decay of the learning rate"),
        )
        .arg(Arg::new("force_cpu").long("force-cpu").help("Only use the host, no accelerator"))
        .arg(
            Arg::new("output_dir")
                .short('o')
                .long("output-dir")
                .takes_value(true)
                .default_value(".")
                .help("Where checkpoint and final images are written"),
        )
        .arg(
            Arg::new("normalize")
                .long("normalize")
                .help("Normalize checkpoint images before rendering"),
        )
        .arg(
            Arg::new("verbosity")
                .short('v')
                .multiple_occurrences(true)
                .help("Sets the level of verbosity."),
        )
}

/// Entrypoint for the command-line interface.
fn main() {
    let matches = command().get_matches();

    let level = match matches.occurrences_of("verbosity") {
        0 => "dream=info,dream_core=warn",
        1 => "dream=info,dream_core=info",
        2 => "dream=debug,dream_core=debug",
        _ => "dream=trace,dream_core=trace",
    };
    let env = env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, level);
    env_logger::Builder::from_env(env).init();

    let outcome = Parameters::from_clap(&matches).and_then(|params| handle(&params));
    if let Err(e) = outcome {
        for cause in e.chain() {
            error!("{}", cause);
        }
        process::exit(1)
    }
}

/// Paths of the model files, or the list of models present in `dir`.
fn ensure_model(dir: &Path, model: &str) -> DreamResult<ModelFiles> {
    let files = ModelFiles::for_model(dir, model);
    if files.exist() {
        return Ok(files);
    }
    let available = ModelFiles::available(dir).unwrap_or_default();
    Err(format_err!("Models available in {:?}: [{}]", dir, available.join(", ")))
        .context(DreamError::ModelLoad { path: files.predict })
}

fn handle(params: &Parameters) -> DreamResult<()> {
    info!("model: {}", params.model);
    info!("layer: {}  channel: {}", params.layer, params.channel);
    info!("label: {}  size: {}", params.label, params.size);
    info!("learning rate: {}  gamma: {}", params.learning_rate, params.gamma);

    let classes = ClassTable::for_path(&params.labels)?;
    let label = classes.index_of(&params.label)?;
    debug!("Label {} is class {} of {}", params.label, label, classes.len());

    let files = ensure_model(&params.models_dir, &params.model)?;
    let start = Instant::now();
    let model = files.load()?;
    let load_time = start.elapsed();

    let runtimes = Runtimes::host();
    let options = params.options(label);
    let mut engine = prepare(&model, &options, &runtimes)?;
    engine.instantiate()?;
    engine.initialize()?;
    if let Some(image) = &params.image {
        engine.set_input(read_image_tensor(image, params.size)?)?;
    }

    let selection = engine.selection();
    let iterations = params.iterations.unwrap_or_else(|| options.iterations(&selection));
    let device = if selection.accelerator { "accelerator" } else { "host" };
    info!("Running {} iterations on {}", iterations, device);
    let mut reporter = CheckpointReporter::new(&params.output_dir, params.normalize)?;
    let dream =
        engine.run(iterations, selection.report_every(DEFAULT_REPORT_INTERVAL), &mut reporter)?;
    write_image_tensor(&dream, &params.output_dir.join("dream.jpg"))?;

    println!(
        "load: {:.3}s  dream: {:.3}s",
        load_time.as_secs_f32(),
        engine.dream_time().as_secs_f32()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_model_lists_available() {
        let dir = tempfile::tempdir().unwrap();
        for file in ["squeezenet_init_net.pb", "squeezenet_predict_net.pb", "vgg_init_net.pb"] {
            fs_err::write(dir.path().join(file), b"").unwrap();
        }
        let err = ensure_model(dir.path(), "alexnet").unwrap_err();
        assert!(matches!(dream_error(&err), Some(DreamError::ModelLoad { .. })));
        assert!(format!("{:#}", err).contains("[squeezenet]"));
        assert!(ensure_model(dir.path(), "squeezenet").is_ok());
    }

    #[test]
    fn unknown_label_before_loading() {
        let dir = tempfile::tempdir().unwrap();
        let labels = dir.path().join("classes.txt");
        fs_err::write(&labels, "tench\ngoldfish\n").unwrap();
        let matches = command()
            .try_get_matches_from([
                "dream",
                "--labels",
                labels.to_str().unwrap(),
                "--models-dir",
                dir.path().to_str().unwrap(),
            ])
            .unwrap();
        let params = Parameters::from_clap(&matches).unwrap();
        let err = handle(&params).unwrap_err();
        assert!(matches!(dream_error(&err), Some(DreamError::LabelNotFound { .. })));
    }
}
