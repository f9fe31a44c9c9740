use percolate_cli::input::{RescoreInput, RetentionInput};
use percolate_cli::runner::{Rescorer, RetentionRunner};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::path::PathBuf;

fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("percolate-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// Alternating targets and decoys, two informative features and one noise column
fn write_pin(path: &PathBuf, psms: usize) {
    let mut rng = StdRng::seed_from_u64(7);
    let mut pin = String::from("SpecId\tLabel\tScanNr\thyperscore\tdelta\tnoise\tPeptide\tProteins\n");
    for i in 0..psms {
        let decoy = i % 2 == 1;
        let shift = match decoy || rng.gen_bool(0.05) {
            true => 0.0,
            false => 2.0,
        };
        pin.push_str(&format!(
            "psm_{}\t{}\t{}\t{}\t{}\t{}\tK.PEPTIDE{}.R\tprot_{}\tprot_{}\n",
            i,
            if decoy { -1 } else { 1 },
            i,
            shift + normal(&mut rng),
            shift + normal(&mut rng),
            normal(&mut rng),
            i,
            i / 4,
            i / 4 + 1
        ));
    }
    std::fs::write(path, pin).unwrap();
}

#[test]
fn rescore_round_trip() -> anyhow::Result<()> {
    let dir = scratch("rescore");
    let pin = dir.join("input.pin");
    write_pin(&pin, 1000);
    let out = dir.join("out");

    let input: RescoreInput = serde_json::from_value(json!({
        "pin": pin,
        "output_directory": out,
        "write_decoys": true,
        "threads": 2,
    }))?;
    Rescorer::new(input.build()?)?.run()?;

    let results = std::fs::read_to_string(out.join("results.percolate.tsv"))?;
    let mut lines = results.lines();
    assert_eq!(
        lines.next(),
        Some("PSMId\tscore\tq-value\tposterior_error_prob\tpeptide\tproteinIds")
    );
    let rows = lines
        .map(|line| line.split('\t').collect::<Vec<_>>())
        .collect::<Vec<_>>();
    assert_eq!(rows.len(), 500);
    assert!(rows.iter().all(|r| r.len() == 6 && r[5].contains(';')));

    // Ranked by score, q-values only increase down the list
    let scores = rows.iter().map(|r| r[1].parse::<f64>().unwrap()).collect::<Vec<_>>();
    let qs = rows.iter().map(|r| r[2].parse::<f64>().unwrap()).collect::<Vec<_>>();
    assert!(scores.windows(2).all(|w| w[0] >= w[1]));
    assert!(qs.windows(2).all(|w| w[0] <= w[1]));
    assert!(qs.iter().filter(|&&q| q <= 0.01).count() > 100);

    let decoys = std::fs::read_to_string(out.join("results.decoys.percolate.tsv"))?;
    assert_eq!(decoys.lines().count(), 501);

    let weights = std::fs::read_to_string(out.join("weights.tsv"))?;
    assert_eq!(weights.lines().next(), Some("# hyperscore delta noise m0"));
    let last = percolate_core::read_weights(out.join("weights.tsv"), 3)?;
    assert!(last.features()[0] > 0.0 && last.features()[1] > 0.0);

    let summary: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(out.join("results.json"))?)?;
    assert_eq!(summary["parameters"]["output_paths"].as_array().map(|a| a.len()), Some(4));

    // Seeding a single fold with the averaged weights and skipping training
    // ranks the targets by those weights alone
    let seeded = dir.join("seeded");
    let input: RescoreInput = serde_json::from_value(json!({
        "pin": pin,
        "output_directory": seeded,
        "initial_weights": out.join("weights.tsv"),
        "engine": { "max_iterations": 0, "folds": 1 },
    }))?;
    Rescorer::new(input.build()?)?.run()?;
    let reseeded = std::fs::read_to_string(seeded.join("results.percolate.tsv"))?;
    let reseeded = reseeded
        .lines()
        .skip(1)
        .map(|l| l.split('\t').next().unwrap().to_string())
        .collect::<Vec<_>>();

    let matrix = percolate_core::read_pin(&pin)?;
    let scores = percolate_core::scoring::score_all(&last, &matrix);
    let mut targets = (0..matrix.len())
        .filter(|&i| !matrix.records()[i].label.is_decoy())
        .collect::<Vec<_>>();
    targets.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));
    let expected = targets
        .into_iter()
        .map(|i| matrix.records()[i].id.clone())
        .collect::<Vec<_>>();
    assert_eq!(reseeded, expected);

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn rescore_failure_writes_nothing() -> anyhow::Result<()> {
    let dir = scratch("rescore-failure");
    let features = dir.join("features.tsv");
    let labels = dir.join("labels.tsv");
    std::fs::write(&features, "id\ta\tb\npsm_1\t1.0\t2.0\npsm_2\t0.5\tnan\n")?;
    std::fs::write(&labels, "psm_1\t1\npsm_2\t-1\n")?;
    let out = dir.join("out");

    let input: RescoreInput = serde_json::from_value(json!({
        "features": features,
        "labels": labels,
        "output_directory": out,
    }))?;
    assert!(Rescorer::new(input.build()?).is_err());
    assert!(!out.exists());

    // Only decoys: nothing to train on
    std::fs::write(&features, "id\ta\tb\npsm_1\t1.0\t2.0\npsm_2\t0.5\t0.1\n")?;
    std::fs::write(&labels, "psm_1\t-1\npsm_2\t-1\n")?;
    let input: RescoreInput = serde_json::from_value(json!({
        "features": features,
        "labels": labels,
        "output_directory": out,
    }))?;
    assert!(Rescorer::new(input.build()?)?.run().is_err());
    assert!(!out.exists());

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

const RESIDUES: &[u8] = b"ADEFGKLW";

fn hydrophobicity(peptide: &str) -> f64 {
    peptide
        .chars()
        .map(|c| match c {
            'W' => 3.0,
            'F' => 2.5,
            'L' => 2.0,
            'A' => 0.5,
            'G' => 0.0,
            'K' => -1.0,
            'D' | 'E' => -1.5,
            _ => 0.0,
        })
        .sum()
}

fn write_peptides(path: &PathBuf, n: usize, seed: u64, with_times: bool) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut out = String::new();
    for _ in 0..n {
        let len = rng.gen_range(6..16);
        let peptide = (0..len)
            .map(|_| RESIDUES[rng.gen_range(0..RESIDUES.len())] as char)
            .collect::<String>();
        match with_times {
            true => {
                let rt = 25.0 + 2.0 * hydrophobicity(&peptide) + 0.2 * normal(&mut rng);
                out.push_str(&format!("{}\t{}\n", peptide, rt));
            }
            false => out.push_str(&format!("{}\n", peptide)),
        }
    }
    std::fs::write(path, out).unwrap();
}

#[test]
fn retention_train_save_predict() -> anyhow::Result<()> {
    let dir = scratch("retention");
    let train = dir.join("train.txt");
    let test = dir.join("test.txt");
    let model = dir.join("model.txt");
    let output = dir.join("predictions.tsv");
    write_peptides(&train, 200, 1, true);
    write_peptides(&test, 50, 2, true);

    let input: RetentionInput = serde_json::from_value(json!({
        "train": train,
        "test": test,
        "test_includes_rt": true,
        "save_model": model,
        "output": output,
    }))?;
    RetentionRunner::new(input.build()?)?.run()?;

    let artifact = std::fs::read_to_string(&model)?;
    assert_eq!(artifact.lines().last(), Some("AA_alphabet 8 A D E F G K L W"));

    let predictions = std::fs::read_to_string(&output)?;
    let mut lines = predictions.lines();
    assert_eq!(lines.next(), Some("peptide\tpredicted_rt\tobserved_rt"));
    let rows = lines
        .map(|l| l.split('\t').map(String::from).collect::<Vec<_>>())
        .collect::<Vec<_>>();
    assert_eq!(rows.len(), 50);
    for row in &rows {
        let predicted = row[1].parse::<f64>()?;
        let observed = row[2].parse::<f64>()?;
        assert!((predicted - observed).abs() < 5.0, "{:?}", row);
    }

    // The saved model predicts the same values
    let reloaded = dir.join("reloaded.tsv");
    let input: RetentionInput = serde_json::from_value(json!({
        "load_model": model,
        "test": test,
        "test_includes_rt": true,
        "output": reloaded,
    }))?;
    RetentionRunner::new(input.build()?)?.run()?;
    assert_eq!(std::fs::read_to_string(&reloaded)?, predictions);

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn retention_inconsistent_alphabet_writes_nothing() -> anyhow::Result<()> {
    let dir = scratch("retention-alphabet");
    let train = dir.join("train.txt");
    let test = dir.join("test.txt");
    let model = dir.join("model.txt");
    let output = dir.join("predictions.tsv");
    write_peptides(&train, 100, 3, true);
    std::fs::write(&test, "LLGK\nPEPTIDY\nAS[unimod:21]K\n")?;

    let input: RetentionInput = serde_json::from_value(json!({
        "train": train,
        "test": test,
        "save_model": model,
        "output": output,
    }))?;
    let err = RetentionRunner::new(input.build()?)?.run().unwrap_err();
    match err.downcast_ref::<percolate_core::Error>() {
        Some(percolate_core::Error::InconsistentAlphabet { missing }) => {
            assert!(missing.contains(&"Y".to_string()));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(!output.exists());
    assert!(!model.exists());

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn retention_library_selection() -> anyhow::Result<()> {
    let dir = scratch("retention-library");
    let library = dir.join("library");
    std::fs::create_dir_all(&library)?;

    // A model trained on reversed retention times, and a faithful one
    let train = dir.join("train.txt");
    write_peptides(&train, 150, 4, true);
    let contents = std::fs::read_to_string(&train)?;
    let reversed = contents
        .lines()
        .map(|line| {
            let (peptide, rt) = line.split_once('\t').unwrap();
            format!("{}\t{}\n", peptide, 50.0 - rt.parse::<f64>().unwrap())
        })
        .collect::<String>();
    let reversed_train = dir.join("reversed.txt");
    std::fs::write(&reversed_train, reversed)?;

    for (name, source) in [("a_reversed.model", &reversed_train), ("b_forward.model", &train)] {
        let input: RetentionInput = serde_json::from_value(json!({
            "train": source,
            "save_model": library.join(name),
        }))?;
        RetentionRunner::new(input.build()?)?.run()?;
    }

    let calibration = dir.join("calibration.txt");
    write_peptides(&calibration, 20, 5, true);
    let selected = dir.join("selected.model");
    let input: RetentionInput = serde_json::from_value(json!({
        "train": calibration,
        "library": library,
        "auto_select": true,
        "linear_calibration": true,
        "save_model": selected,
    }))?;
    RetentionRunner::new(input.build()?)?.run()?;

    let chosen = percolate_core::read_retention_model(&selected)?;
    let forward = percolate_core::read_retention_model(library.join("b_forward.model"))?;
    assert_eq!(chosen.index(), forward.index());
    assert!(chosen.calibration().is_some());

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}
