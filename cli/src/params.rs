use std::path::PathBuf;

use clap::ArgMatches;
use dream_core::dream::DreamOptions;
use dream_core::internal::*;

/// What the dream maximizes, as chosen on the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectiveKind {
    Channel,
    Class,
}

/// Structure holding the parsed parameters.
#[derive(Clone, Debug)]
pub struct Parameters {
    pub model: String,
    pub models_dir: PathBuf,
    pub layer: String,
    pub channel: usize,
    pub objective: ObjectiveKind,
    pub image: Option<PathBuf>,
    pub label: String,
    pub labels: PathBuf,
    /// Overrides the default run count, which depends on the device.
    pub iterations: Option<usize>,
    pub size: usize,
    pub learning_rate: f32,
    pub gamma: f32,
    pub force_cpu: bool,
    pub output_dir: PathBuf,
    pub normalize: bool,
}

impl Parameters {
    pub fn from_clap(matches: &ArgMatches) -> DreamResult<Parameters> {
        let string = |name: &str| -> DreamResult<String> {
            matches
                .value_of(name)
                .map(|s| s.to_string())
                .ok_or_else(|| format_err!("Missing value for --{}", name))
        };
        let objective = match matches.value_of("objective") {
            Some("class") => ObjectiveKind::Class,
            Some("channel") | None => ObjectiveKind::Channel,
            Some(other) => bail!("Unknown objective {:?}, expected channel or class", other),
        };
        let iterations = match matches.value_of("iterations") {
            Some(n) => Some(n.parse().with_context(|| format!("Parsing iterations {:?}", n))?),
            None => None,
        };
        let params = Parameters {
            model: string("model")?,
            models_dir: string("models_dir")?.into(),
            layer: string("layer")?,
            channel: matches.value_of_t("channel")?,
            objective,
            image: matches.value_of("image").map(PathBuf::from),
            label: string("label")?,
            labels: string("labels")?.into(),
            iterations,
            size: matches.value_of_t("size")?,
            learning_rate: matches.value_of_t("learning_rate")?,
            gamma: matches.value_of_t("gamma")?,
            force_cpu: matches.is_present("force_cpu"),
            output_dir: string("output_dir")?.into(),
            normalize: matches.is_present("normalize"),
        };
        params.validate()?;
        Ok(params)
    }

    fn validate(&self) -> DreamResult<()> {
        ensure!(!self.model.is_empty(), "Specify a model name using --model <name>");
        ensure!(!self.label.is_empty(), "Specify a label name using --label <name>");
        ensure!(!self.layer.is_empty(), "Specify a layer name using --layer <name>");
        ensure!(self.size > 0, "Image size must be positive");
        self.schedule().validate()
    }

    pub fn schedule(&self) -> LearningRateSchedule {
        LearningRateSchedule::new(self.learning_rate, LrPolicy::Exp { gamma: self.gamma })
    }

    /// Engine options, `label` being the resolved class index.
    pub fn options(&self, label: usize) -> DreamOptions {
        let objective = match self.objective {
            ObjectiveKind::Channel => {
                Objective::Channel { layer: self.layer.clone(), channel: self.channel }
            }
            ObjectiveKind::Class => Objective::Class { label },
        };
        DreamOptions {
            objective,
            input_shape: tvec!(1, 3, self.size, self.size),
            schedule: self.schedule(),
            force_cpu: self.force_cpu,
        }
    }
}
