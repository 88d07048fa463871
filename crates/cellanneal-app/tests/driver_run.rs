use cellanneal_app::{Driver, InputFrame, discover_frames, load_gray, save_gray};
use cellanneal_core::render::render_cells;
use cellanneal_core::{AnnealConfig, Bacilli, Cell, Field, RenderParams};
use cellanneal_storage::{group_by_file, read_cell_table};
use std::fs;
use std::path::Path;

fn write_sequence(dir: &Path, frames: usize) -> Vec<Cell> {
    (0..frames)
        .map(|i| {
            let cell: Cell = Bacilli::new("a", 16.0 + i as f64, 12.0, 4.0, 12.0, 0.1).into();
            let (image, _) =
                render_cells([&cell], 32, 24, &RenderParams::default()).expect("render");
            save_gray(&image, &dir.join(format!("t{i:02}.png"))).expect("save");
            cell
        })
        .collect()
}

fn config() -> AnnealConfig {
    let mut config = AnnealConfig::default();
    config.schedule.iterations_per_cell = 200;
    config.schedule.window_size = 2;
    config.trials.jobs = 2;
    config.rng_seed = Some(11);
    config.prepared().expect("config")
}

#[test]
fn sliding_windows_write_every_frame() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("input");
    fs::create_dir_all(&input).expect("mkdir");
    let truth = write_sequence(&input, 3);

    let start = truth[0].with_offset(Field::X, 1.0);
    let Cell::Bacilli(rod) = &start else {
        panic!("expected a rod");
    };
    let table = dir.path().join("initial.csv");
    fs::write(
        &table,
        format!(
            "file,name,x,y,width,length,rotation,split_alpha,opacity\nt00.png,a,{},{},{},{},{},None,None\n",
            rod.position.x, rod.position.y, rod.width, rod.length, rod.rotation
        ),
    )
    .expect("table");

    let pattern = format!("{}/t%02d.png", input.display());
    let frames: Vec<InputFrame> = discover_frames(&pattern, 0, None)
        .expect("frames")
        .into_iter()
        .map(|path| {
            let image = load_gray(&path).expect("load");
            InputFrame { path, image }
        })
        .collect();
    assert_eq!(frames.len(), 3);

    let (_, records) = read_cell_table(&table).expect("read");
    let output = dir.path().join("out");
    let mut driver = Driver::new(config(), frames, group_by_file(records), &output).expect("driver");
    assert_eq!(driver.lineage().len(), 1);
    let summary = driver.run().expect("run");
    assert_eq!(summary.frames, 3);
    assert_eq!(summary.windows, 4);
    assert_eq!(driver.lineage().len(), 3);
    drop(driver);

    let (_, written) = read_cell_table(&output.join("cells.csv")).expect("cells");
    let files: Vec<&str> = written.iter().map(|r| r.file.as_str()).collect();
    assert!(files.contains(&"t00.png") && files.contains(&"t02.png"));
    assert!(files.windows(2).all(|pair| pair[0] <= pair[1]));
    for index in 0..3 {
        assert!(output.join("real").join(format!("{index}.png")).is_file());
        assert!(output.join("synth").join(format!("{index}.png")).is_file());
    }
    let log = fs::read_to_string(output.join("windows.jsonl")).expect("log");
    assert_eq!(log.lines().count(), 4);
    let first: serde_json::Value = serde_json::from_str(log.lines().next().expect("line")).expect("json");
    assert_eq!(first["window"]["end"], 1);
}

#[test]
fn mismatched_cell_type_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_sequence(dir.path(), 1);
    let path = dir.path().join("t00.png");
    let frames = vec![InputFrame {
        image: load_gray(&path).expect("load"),
        path,
    }];
    let mut config = config();
    config.global.cell_type = cellanneal_core::CellType::Sphere;
    let initial = vec![(
        "t00.png".to_string(),
        vec![Bacilli::new("a", 16.0, 12.0, 4.0, 12.0, 0.0).into()],
    )];
    let result = Driver::new(config, frames, initial, &dir.path().join("out"));
    assert!(result.is_err());
}
