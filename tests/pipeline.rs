use std::{fs, path::Path};

use image::{Rgb, RgbImage};
use machine_learning::arch::Mode;
use ndarray::Array4;

use quake_regression::{
    QuakeErr,
    config::RunConfig,
    model::{Backbone, BackboneWeights, Cnn, ModelConfig},
    pipeline::{self, BEST_CHECKPOINT},
};

const REFERENCE_HEADER: &str = "Image,Date,Mag,Lon,Lat,Depth\n";

/// Writes one small image per name to `dir` and returns their reference rows.
fn write_split(dir: &Path, names: &[&str], shade: u8) -> String {
    fs::create_dir_all(dir).unwrap();

    let mut rows = String::new();
    for (i, name) in names.iter().enumerate() {
        let i = i as u8;
        RgbImage::from_fn(12, 12, |x, y| Rgb([shade + i * 10, x as u8 * 8, y as u8 * 8]))
            .save(dir.join(name))
            .unwrap();

        rows.push_str(&format!(
            "{name},2020-01-0{},{}.{},{}.5,{}.25,{}.0\n",
            i + 1,
            4 + i,
            i,
            -120 + i as i32,
            35 + i as i32,
            10 + i as u32
        ));
    }

    rows
}

struct Fixture {
    root: tempfile::TempDir,
}

impl Fixture {
    fn new(test_names: &[&str]) -> Self {
        let root = tempfile::tempdir().unwrap();
        let base = root.path();

        let mut reference = REFERENCE_HEADER.to_string();
        reference += &write_split(&base.join("train"), &["t0.png", "t1.png", "t2.png"], 10);
        reference += &write_split(&base.join("val"), &["v0.png", "v1.png"], 60);
        reference += &write_split(&base.join("test"), &["x0.png", "x1.png", "x2.png"], 120);

        // Test images may be given names the reference table doesn't know.
        for name in test_names {
            RgbImage::from_pixel(12, 12, Rgb([1, 2, 3]))
                .save(base.join("test").join(name))
                .unwrap();
        }

        fs::write(base.join("Earthquake.csv"), reference).unwrap();
        Self { root }
    }

    fn path(&self, name: &str) -> String {
        self.root.path().join(name).display().to_string()
    }

    fn config(&self, use_auxiliary_parameters: bool) -> RunConfig {
        let json = format!(
            r#"{{
                "model": {{
                    "backbone": "simple_cnn",
                    "use_auxiliary_parameters": {use_auxiliary_parameters}
                }},
                "data": {{
                    "reference": "{}",
                    "train_dir": "{}",
                    "val_dir": "{}",
                    "test_dir": "{}",
                    "target": "mag",
                    "auxiliary": ["lon", "lat"],
                    "image_size": 8,
                    "output_dir": "{}"
                }},
                "training": {{
                    "batch_size": 2,
                    "epochs": 2,
                    "optimizer": {{ "type": "adam", "lr": 0.001 }},
                    "seed": 7
                }}
            }}"#,
            self.path("Earthquake.csv"),
            self.path("train"),
            self.path("val"),
            self.path("test"),
            self.path("out"),
        );

        RunConfig::from_json(&json).unwrap()
    }

    fn predictions_files(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(self.root.path().join("out")) else {
            return Vec::new();
        };

        entries
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("Prediction("))
            .collect()
    }
}

#[test]
fn fit_keeps_the_best_model_and_tests_it() {
    let fixture = Fixture::new(&[]);
    let config = fixture.config(true);

    let report = pipeline::fit(&config).unwrap();

    assert_eq!(report.epochs.len(), 2);
    assert!(report.epochs.iter().all(|e| e.train_loss.is_finite() && e.val_mae >= 0.));
    assert!(report.checkpoint.ends_with(BEST_CHECKPOINT));
    assert!(report.checkpoint.exists());

    let best = report.epochs[report.best_epoch - 1].val_mae;
    assert!(report.epochs.iter().all(|e| e.val_mae >= best));

    let test = report.test.unwrap();
    assert_eq!(test.rows, 3);
    assert_eq!(fixture.predictions_files().len(), 1);

    let written = fs::read_to_string(&test.path).unwrap();
    let mut lines = written.lines();
    assert_eq!(lines.next(), Some("id,Mag,prediction"));
    assert_eq!(lines.next().unwrap().split(',').take(2).collect::<Vec<_>>(), ["x0.png", "4.0"]);
    assert_eq!(lines.count(), 2);

    // Testing the kept checkpoint on its own reproduces the same error.
    let again = pipeline::evaluate(&config, &report.checkpoint).unwrap();
    assert_eq!(again.mae, test.mae);
    assert_eq!(again.path, test.path);
}

#[test]
fn checkpoints_only_load_into_the_same_architecture() {
    let fixture = Fixture::new(&[]);
    let report = pipeline::fit(&fixture.config(false)).unwrap();

    let err = pipeline::evaluate(&fixture.config(true), &report.checkpoint).unwrap_err();
    assert!(matches!(err, QuakeErr::Checkpoint(_)));
}

#[test]
fn unknown_test_images_abort_the_export() {
    let fixture = Fixture::new(&["unknown.png"]);
    let config = fixture.config(false);

    let model = Cnn::new(config.model.model_config(), BackboneWeights::Random, 0).unwrap();
    let checkpoint = fixture.root.path().join("random.safetensors");
    model.save_checkpoint(&checkpoint).unwrap();

    let err = pipeline::evaluate(&config, &checkpoint).unwrap_err();

    assert!(matches!(err, QuakeErr::MissingReference { ref id, .. } if id == "unknown.png"));
    assert!(fixture.predictions_files().is_empty());
}

#[test]
fn every_backbone_embeds_to_its_width() {
    for backbone in Backbone::ALL {
        let config = ModelConfig {
            backbone,
            use_auxiliary_parameters: false,
        };
        let mut model = Cnn::new(config, BackboneWeights::Random, 0).unwrap();

        let images = Array4::from_elem((2, 3, 32, 32), 0.25);
        let features = model.embed(images.clone(), Mode::Eval).unwrap();
        assert_eq!(features.dim(), (2, backbone.feature_dim()));

        let predictions = model.forward(images, None, Mode::Eval).unwrap();
        assert_eq!(predictions.len(), 2);
    }
}
