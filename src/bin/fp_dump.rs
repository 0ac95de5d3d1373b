use featurepack::{FeatureStore, Value};
use wkt::to_wkt::write_geometry;

fn main() {
    if let Err(err) = run() {
        eprintln!("fp_dump failed: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::args()
        .nth(1)
        .ok_or("Usage: fp_dump <path-to-gpkg>")?;
    let store = FeatureStore::open_read_only(path)?;

    for table_name in store.list_tables()? {
        let table = store.table(&table_name)?;
        println!("table: {table_name}");

        let columns = table.columns();
        let null = Value::Null;
        for (row_idx, feature) in table.features()?.enumerate() {
            let mut values = Vec::with_capacity(columns.len() + 1);
            if let Some(geom) = feature.geometry()? {
                let mut wkt = String::new();
                write_geometry(&mut wkt, &geom)?;
                values.push(wkt);
            }
            for column in &columns {
                let value = feature.property(&column.name).unwrap_or(&null);
                values.push(format!("{}={}", column.name, format_value(value)));
            }
            println!("  row {}: {}", row_idx, values.join(", "));
        }
    }

    Ok(())
}

fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(value) => value.to_string(),
        Value::Real(value) => value.to_string(),
        Value::Text(value) => value.clone(),
        Value::Blob(value) => format!("{value:?}"),
    }
}
