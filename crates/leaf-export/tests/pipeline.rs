//! Train-then-export run on a tiny two-class dataset.

use std::fs;
use std::path::Path;

use burn::backend::{Autodiff, NdArray};
use leaf_core::{Error, PipelineConfig};
use leaf_dataset::{generate, SyntheticSpec, ValidationSource};
use leaf_export::{Exporter, ModelProto, BATCH_PARAM, OPSET_VERSION};
use prost::Message;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tempfile::TempDir;

type TrainBackend = Autodiff<NdArray>;

fn config(root: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.dataset.root = root.join("dataset");
    config.dataset.image_size = 32;
    config.dataset.batch_size = 4;
    config.dataset.num_workers = 2;
    config.training.epochs = 1;
    config.output.path = root.join("out").join("leafsense_model.onnx");
    config
}

fn two_class_dataset(root: &Path) {
    let spec = SyntheticSpec {
        classes: vec!["a".into(), "b".into()],
        train_per_class: 10,
        val_per_class: 0,
        image_size: 40,
    };
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    generate(&root.join("dataset"), &spec, &mut rng).unwrap();
}

#[test]
fn test_train_and_export_two_classes() {
    let temp = TempDir::new().unwrap();
    two_class_dataset(temp.path());
    let config = config(temp.path());
    let device = Default::default();

    let report = leaf_training::train::<TrainBackend>(&config, &device).unwrap();
    assert_eq!(report.validation_source, ValidationSource::HeldOut);
    assert_eq!(report.train_samples, 16);
    assert_eq!(report.val_samples, 4);
    assert_eq!(report.checkpoints_written, 1);
    assert!(report.checkpoint.as_ref().is_some_and(|paths| paths.exists()));

    let exporter = Exporter::from_report(&config, &report).unwrap();
    let artifact = exporter.export::<NdArray>(&device).unwrap();
    assert_eq!(artifact.num_classes, 2);
    assert_eq!(fs::read_to_string(&artifact.class_file).unwrap(), "a\nb\n");

    let bytes = fs::read(&artifact.model_path).unwrap();
    let model = ModelProto::decode(bytes.as_slice()).unwrap();
    assert_eq!(model.opset_import[0].version, OPSET_VERSION);
    let graph = model.graph.unwrap();
    assert_eq!(graph.input[0].name, "input");
    assert_eq!(
        graph.input[0].shape(),
        vec![Err(BATCH_PARAM.to_string()), Ok(3), Ok(32), Ok(32)]
    );
    assert_eq!(graph.output[0].name, "output");
    assert_eq!(graph.output[0].shape(), vec![Err(BATCH_PARAM.to_string()), Ok(2)]);

    let dims = |name: &str| {
        graph
            .initializer
            .iter()
            .find(|tensor| tensor.name == name)
            .map(|tensor| tensor.dims.clone())
    };
    assert_eq!(dims("classifier.weight"), Some(vec![1024, 2]));
    assert_eq!(dims("classifier.bias"), Some(vec![2]));

    let head = graph.node.last().unwrap();
    assert_eq!(head.op_type, "Gemm");
    assert_eq!(head.input[1..], ["classifier.weight", "classifier.bias"]);
    assert_eq!(head.output, vec!["output".to_string()]);
}

#[test]
fn test_rerun_without_improvement_does_not_export_previous_model() {
    let temp = TempDir::new().unwrap();
    two_class_dataset(temp.path());
    let config = config(temp.path());
    let device = Default::default();

    let first = leaf_training::train::<TrainBackend>(&config, &device).unwrap();
    assert_eq!(first.checkpoints_written, 1);
    Exporter::from_report(&config, &first)
        .unwrap()
        .export::<NdArray>(&device)
        .unwrap();
    let class_file = config.output.class_file();
    assert_eq!(fs::read_to_string(&class_file).unwrap(), "a\nb\n");

    // Same output path, new classes and an empty val/ partition.
    let dataset = temp.path().join("dataset");
    fs::remove_dir_all(&dataset).unwrap();
    for class in ["x", "y", "z"] {
        let train_dir = dataset.join("train").join(class);
        fs::create_dir_all(&train_dir).unwrap();
        fs::create_dir_all(dataset.join("val").join(class)).unwrap();
        for i in 0..2 {
            image::RgbImage::new(40, 40)
                .save(train_dir.join(format!("{i}.png")))
                .unwrap();
        }
    }

    let second = leaf_training::train::<TrainBackend>(&config, &device).unwrap();
    assert_eq!(second.classes.names(), &["x", "y", "z"]);
    assert_eq!(second.val_samples, 0);
    assert_eq!(second.checkpoints_written, 0);
    assert!(second.checkpoint.is_none());

    let result = Exporter::from_report(&config, &second);
    assert!(matches!(result, Err(Error::ExportPrecondition(_))));
    let result = Exporter::from_config(&config).export::<NdArray>(&device);
    assert!(matches!(result, Err(Error::ExportPrecondition(_))));
}

#[test]
fn test_export_is_deterministic() {
    let temp = TempDir::new().unwrap();
    two_class_dataset(temp.path());
    let config = config(temp.path());
    let device = Default::default();

    leaf_training::train::<TrainBackend>(&config, &device).unwrap();
    let exporter = Exporter::from_config(&config);

    let first = exporter.export::<NdArray>(&device).unwrap();
    let model_bytes = fs::read(&first.model_path).unwrap();
    let class_bytes = fs::read(&first.class_file).unwrap();

    let second = exporter.export::<NdArray>(&device).unwrap();
    assert_eq!(fs::read(&second.model_path).unwrap(), model_bytes);
    assert_eq!(fs::read(&second.class_file).unwrap(), class_bytes);
}

#[test]
fn test_class_order_stable_across_runs() {
    let temp = TempDir::new().unwrap();
    two_class_dataset(temp.path());
    let config = config(temp.path());

    let first = leaf_dataset::LeafData::from_config(&config.dataset).unwrap();
    let second = leaf_dataset::LeafData::from_config(&config.dataset).unwrap();
    assert_eq!(first.classes, second.classes);
    assert_eq!(first.classes.names(), &["a", "b"]);
}
