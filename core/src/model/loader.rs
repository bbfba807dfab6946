use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::Context;
use prost::Message;

use crate::errors::{DreamError, DreamResult};
use crate::model::{GraphDef, ModelPair};
use crate::pb::caffe2::NetDef;

/// Load a caffe2 `NetDef` from a reader.
pub fn graph_for_reader<R: Read>(mut r: R) -> DreamResult<GraphDef> {
    let mut bytes = vec![];
    r.read_to_end(&mut bytes)?;
    let net = NetDef::decode(&*bytes).context("Decoding NetDef protobuf")?;
    net.to_graph()
}

/// Load a caffe2 `NetDef` from a file.
pub fn graph_for_path<P: AsRef<Path>>(p: P) -> DreamResult<GraphDef> {
    let path = p.as_ref();
    std::fs::File::open(path)
        .map_err(anyhow::Error::from)
        .and_then(graph_for_reader)
        .with_context(|| DreamError::ModelLoad { path: path.to_path_buf() })
}

/// The two files of a model, `<dir>/<model>_init_net.pb` and
/// `<dir>/<model>_predict_net.pb`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelFiles {
    pub init: PathBuf,
    pub predict: PathBuf,
}

impl ModelFiles {
    pub fn for_model(dir: impl AsRef<Path>, model: &str) -> ModelFiles {
        let dir = dir.as_ref();
        ModelFiles {
            init: dir.join(format!("{}_init_net.pb", model)),
            predict: dir.join(format!("{}_predict_net.pb", model)),
        }
    }

    pub fn exist(&self) -> bool {
        self.init.is_file() && self.predict.is_file()
    }

    /// Names of the models with both files present in `dir`.
    pub fn available(dir: impl AsRef<Path>) -> DreamResult<Vec<String>> {
        let dir = dir.as_ref();
        let mut models = vec![];
        for entry in std::fs::read_dir(dir).with_context(|| format!("Listing {:?}", dir))? {
            let name = entry?.file_name();
            if let Some(model) = name.to_str().and_then(|n| n.strip_suffix("_predict_net.pb")) {
                if ModelFiles::for_model(dir, model).exist() {
                    models.push(model.to_string());
                }
            }
        }
        models.sort();
        Ok(models)
    }

    pub fn load(&self) -> DreamResult<ModelPair> {
        let init = graph_for_path(&self.init)?;
        let predict = graph_for_path(&self.predict)?;
        info!(
            "Loaded {} init and {} predict nodes from {:?}",
            init.nodes.len(),
            predict.nodes.len(),
            self.predict
        );
        Ok(ModelPair::new(init, predict))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::dream_error;

    #[test]
    fn missing_file_is_a_model_load_error() {
        let e = graph_for_path("/nonexistent/alexnet_init_net.pb").unwrap_err();
        assert_eq!(
            dream_error(&e),
            Some(&DreamError::ModelLoad { path: "/nonexistent/alexnet_init_net.pb".into() })
        );
    }

    #[test]
    fn garbage_is_a_model_load_error() {
        let e = graph_for_reader(&[0xffu8, 0xff, 0xff][..]).unwrap_err();
        assert!(e.to_string().contains("NetDef"));
    }

    #[test]
    fn file_names() {
        let files = ModelFiles::for_model("res", "alexnet");
        assert_eq!(files.init, Path::new("res/alexnet_init_net.pb"));
        assert_eq!(files.predict, Path::new("res/alexnet_predict_net.pb"));
    }
}
