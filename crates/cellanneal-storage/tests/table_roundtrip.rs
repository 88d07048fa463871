use cellanneal_core::render::render_cells;
use cellanneal_core::{AnnealConfig, Bacilli, Cell, CellType, Lineage, RenderParams, Sphere};
use cellanneal_storage::{
    TablePipeline, group_by_file, lineage_rows, read_cell_table, write_cell_table,
};
use std::fs;
use std::io::BufWriter;

fn lineage_from(groups: &[(String, Vec<Cell>)]) -> Lineage {
    let mut lineage = Lineage::new(&AnnealConfig::default());
    for (_, cells) in groups {
        let (real, _) = render_cells(cells.iter(), 48, 32, &RenderParams::default()).expect("render");
        let index = lineage.forward(real, RenderParams::default()).expect("frame");
        for cell in cells {
            lineage.add_cell(index, cell.clone()).expect("cell");
        }
        lineage.render_frame(index).expect("render");
    }
    lineage
}

#[test]
fn lineage_written_to_disk_reads_back_sorted() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("initial.csv");
    fs::write(
        &input,
        "file,name,x,y,width,length,rotation,split_alpha,opacity\n\
         b.png,z,30,16,4,12,0.2,None,None\n\
         a.png,q,12,16,4,14,0,None,None\n\
         a.png,m,30,16,4,12,0.1,None,0.8\n",
    )
    .expect("write input");

    let (cell_type, records) = read_cell_table(&input).expect("read");
    assert_eq!(cell_type, CellType::Bacilli);
    let groups = group_by_file(records);
    let files: Vec<String> = groups.iter().map(|(file, _)| file.clone()).collect();
    assert_eq!(files, ["b.png", "a.png"]);

    let lineage = lineage_from(&groups);
    let rows = lineage_rows(&lineage, &files, lineage.len());
    let order: Vec<(&str, &str)> = rows
        .iter()
        .map(|row| (row.file.as_str(), row.cell.name()))
        .collect();
    assert_eq!(order, [("a.png", "m"), ("a.png", "q"), ("b.png", "z")]);

    let output = dir.path().join("out").join("cells.csv");
    fs::create_dir_all(output.parent().expect("parent")).expect("mkdir");
    {
        let mut writer = BufWriter::new(fs::File::create(&output).expect("create"));
        write_cell_table(
            &mut writer,
            cell_type,
            rows.iter().map(|row| (row.file.as_str(), &row.cell)),
        )
        .expect("write");
    }
    let (_, again) = read_cell_table(&output).expect("read back");
    assert_eq!(again, rows);
    let Cell::Bacilli(m) = &again[0].cell else {
        panic!("expected a rod");
    };
    assert_eq!(m.opacity, Some(0.8));
}

#[test]
fn pipeline_flushes_every_frame_on_drop() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("nested").join("cells.csv");
    let spheres: Vec<Cell> = vec![
        Sphere::new("b", 10.0, 10.0, 0.0, 4.0).into(),
        Sphere::new("a", 24.0, 10.0, 1.5, 5.0).into(),
    ];
    {
        let pipeline = TablePipeline::new(&path, CellType::Sphere).expect("pipeline");
        pipeline.append("f0.png", spheres.clone());
        pipeline.append("f1.png", spheres[..1].to_vec());
        // A rod does not belong in a sphere table and is skipped.
        pipeline.append("f1.png", vec![Bacilli::new("r", 5.0, 5.0, 2.0, 6.0, 0.0).into()]);
        pipeline.flush();
    }

    let (cell_type, records) = read_cell_table(&path).expect("read");
    assert_eq!(cell_type, CellType::Sphere);
    let order: Vec<(&str, &str)> = records
        .iter()
        .map(|record| (record.file.as_str(), record.cell.name()))
        .collect();
    assert_eq!(order, [("f0.png", "a"), ("f0.png", "b"), ("f1.png", "b")]);
    let Cell::Sphere(a) = &records[0].cell else {
        panic!("expected a sphere");
    };
    assert_eq!((a.z, a.radius), (1.5, 5.0));
}
