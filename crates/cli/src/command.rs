//! Command parsing and dispatch for the storage-group REPL.

use engine::StorageGroupProcessor;
use memtable::DataValue;

pub enum Outcome {
    Continue,
    Exit,
}

/// Parses `value[:type]` into a typed sample. Without an explicit type,
/// infers from the literal's shape: an integer becomes `i64`, `true`/`false`
/// becomes `bool`, a decimal becomes `f64`, anything else is `text`.
fn parse_value(token: &str) -> Result<DataValue, String> {
    let (value, ty) = match token.rsplit_once(':') {
        Some((v, t)) if matches!(t, "i32" | "i64" | "f32" | "f64" | "bool" | "text") => (v, Some(t)),
        _ => (token, None),
    };

    match ty {
        Some("i32") => value.parse::<i32>().map(DataValue::Int32).map_err(|e| e.to_string()),
        Some("i64") => value.parse::<i64>().map(DataValue::Int64).map_err(|e| e.to_string()),
        Some("f32") => value.parse::<f32>().map(DataValue::Float).map_err(|e| e.to_string()),
        Some("f64") => value.parse::<f64>().map(DataValue::Double).map_err(|e| e.to_string()),
        Some("bool") => value.parse::<bool>().map(DataValue::Bool).map_err(|e| e.to_string()),
        Some("text") => Ok(DataValue::Text(value.to_string())),
        Some(_) => unreachable!("matched above"),
        None => {
            if let Ok(i) = value.parse::<i64>() {
                Ok(DataValue::Int64(i))
            } else if let Ok(b) = value.parse::<bool>() {
                Ok(DataValue::Bool(b))
            } else if let Ok(f) = value.parse::<f64>() {
                Ok(DataValue::Double(f))
            } else {
                Ok(DataValue::Text(value.to_string()))
            }
        }
    }
}

fn format_value(value: &DataValue) -> String {
    match value {
        DataValue::Int32(v) => v.to_string(),
        DataValue::Int64(v) => v.to_string(),
        DataValue::Float(v) => v.to_string(),
        DataValue::Double(v) => v.to_string(),
        DataValue::Bool(v) => v.to_string(),
        DataValue::Text(v) => v.clone(),
    }
}

pub fn dispatch(sg: &StorageGroupProcessor, line: &str) -> Outcome {
    let mut parts = line.split_whitespace();
    let Some(cmd) = parts.next() else { return Outcome::Continue };

    match cmd.to_uppercase().as_str() {
        "INSERT" => insert(sg, parts),
        "INSERT-TABLET" => insert_tablet(sg, parts),
        "QUERY" => query(sg, parts),
        "DELETE" => delete(sg, parts),
        "MERGE" => merge(sg, parts),
        "CLOSE" => close(sg, parts),
        "STATS" => println!("{:?}", sg),
        "EXIT" | "QUIT" => return Outcome::Exit,
        other => println!("unknown command: {other}"),
    }

    Outcome::Continue
}

fn insert<'a>(sg: &StorageGroupProcessor, mut parts: impl Iterator<Item = &'a str>) {
    let (Some(device), Some(measurement), Some(ts), Some(raw_value)) = (parts.next(), parts.next(), parts.next(), parts.next()) else {
        println!("ERR usage: INSERT device measurement timestamp value[:type]");
        return;
    };
    let Ok(timestamp) = ts.parse::<i64>() else {
        println!("ERR timestamp must be an integer");
        return;
    };
    let value = match parse_value(raw_value) {
        Ok(v) => v,
        Err(e) => {
            println!("ERR invalid value: {e}");
            return;
        }
    };
    match sg.insert(device, measurement, timestamp, value) {
        Ok(()) => println!("OK"),
        Err(e) => println!("ERR insert failed: {e}"),
    }
}

fn insert_tablet<'a>(sg: &StorageGroupProcessor, mut parts: impl Iterator<Item = &'a str>) {
    let (Some(device), Some(measurement)) = (parts.next(), parts.next()) else {
        println!("ERR usage: INSERT-TABLET device measurement ts0:v0 ts1:v1 ...");
        return;
    };

    let mut rows = Vec::new();
    for pair in parts {
        let Some((ts, raw_value)) = pair.split_once(':') else {
            println!("ERR malformed pair {pair}, expected ts:value");
            return;
        };
        let Ok(timestamp) = ts.parse::<i64>() else {
            println!("ERR timestamp must be an integer in pair {pair}");
            return;
        };
        let value = match parse_value(raw_value) {
            Ok(v) => v,
            Err(e) => {
                println!("ERR invalid value in pair {pair}: {e}");
                return;
            }
        };
        rows.push((timestamp, vec![(measurement.to_string(), value)]));
    }

    if rows.is_empty() {
        println!("ERR usage: INSERT-TABLET device measurement ts0:v0 ts1:v1 ...");
        return;
    }

    let results = sg.insert_tablet(device, &rows);
    let failures = results.iter().filter(|r| r.is_err()).count();
    if failures == 0 {
        println!("OK ({} rows)", results.len());
    } else {
        println!("ERR {failures}/{} rows failed", results.len());
    }
}

fn query<'a>(sg: &StorageGroupProcessor, mut parts: impl Iterator<Item = &'a str>) {
    let (Some(device), Some(measurement)) = (parts.next(), parts.next()) else {
        println!("ERR usage: QUERY device measurement [start end]");
        return;
    };
    let bounds = match (parts.next(), parts.next()) {
        (Some(s), Some(e)) => match (s.parse::<i64>(), e.parse::<i64>()) {
            (Ok(s), Ok(e)) => Some((s, e)),
            _ => {
                println!("ERR start/end must be integers");
                return;
            }
        },
        _ => None,
    };

    match sg.query(device, measurement).collect(sg.cache()) {
        Ok(samples) => {
            let samples: Vec<_> = match bounds {
                Some((start, end)) => samples.into_iter().filter(|(t, _)| *t >= start && *t < end).collect(),
                None => samples,
            };
            if samples.is_empty() {
                println!("(empty)");
            } else {
                for (ts, value) in &samples {
                    println!("{ts} -> {}", format_value(value));
                }
                println!("({} samples)", samples.len());
            }
        }
        Err(e) => println!("ERR query failed: {e}"),
    }
}

fn delete<'a>(sg: &StorageGroupProcessor, mut parts: impl Iterator<Item = &'a str>) {
    let (Some(device), Some(measurement), Some(bound)) = (parts.next(), parts.next(), parts.next()) else {
        println!("ERR usage: DELETE device measurement upperBound");
        return;
    };
    let Ok(upper_bound) = bound.parse::<i64>() else {
        println!("ERR upperBound must be an integer");
        return;
    };
    match sg.delete(device, measurement, upper_bound) {
        Ok(()) => println!("OK"),
        Err(e) => println!("ERR delete failed: {e}"),
    }
}

fn merge<'a>(sg: &StorageGroupProcessor, mut parts: impl Iterator<Item = &'a str>) {
    let full = matches!(parts.next(), Some(arg) if arg.eq_ignore_ascii_case("full"));
    match sg.merge(full) {
        Ok(()) => {
            let stats = sg.stats();
            println!("OK (seq={}, unseq={})", stats.seq_files, stats.unseq_files);
        }
        Err(e) => println!("ERR merge failed: {e}"),
    }
}

fn close<'a>(sg: &StorageGroupProcessor, mut parts: impl Iterator<Item = &'a str>) {
    let Some(device) = parts.next() else {
        println!("ERR usage: CLOSE device measurement");
        return;
    };
    match sg.close_device(device) {
        Ok(()) => println!("OK"),
        Err(e) => println!("ERR close failed: {e}"),
    }
}
