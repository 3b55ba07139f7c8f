use std::{
    io::{self, Write},
    time::{SystemTime, UNIX_EPOCH},
};

use serde_json::{Map, Value};

use crate::PowerQueryResult;

/// What kind of [`Output`] to build, as chosen by an external caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// A header line, then one row per socket. The header is repeated when the fields change.
    #[default]
    Tabular,
    /// One `name: value` line per socket.
    Verbose,
    /// JSON record.
    Json,
}

/// Destination of the results of one dispatch call.
pub enum Output<'a> {
    Console {
        writer: &'a mut dyn Write,
        verbose: bool,
        /// Field names of the last tabular header.
        columns: Vec<String>,
    },
    Json(&'a mut Map<String, Value>),
}

impl<'a> Output<'a> {
    pub fn console(writer: &'a mut dyn Write, verbose: bool) -> Output<'a> {
        Output::Console {
            writer,
            verbose,
            columns: Vec::new(),
        }
    }

    pub fn json(record: &'a mut Map<String, Value>) -> Output<'a> {
        Output::Json(record)
    }

    pub fn mode(&self) -> OutputMode {
        match self {
            Output::Console { verbose: false, .. } => OutputMode::Tabular,
            Output::Console { verbose: true, .. } => OutputMode::Verbose,
            Output::Json(_) => OutputMode::Json,
        }
    }

    /// Writes the result of one socket. `first` is true for the first socket of a query.
    pub fn emit(&mut self, result: &PowerQueryResult, first: bool) -> io::Result<()> {
        let label = result.query.name().to_uppercase();
        match self {
            Output::Console {
                writer,
                verbose: false,
                columns,
            } => {
                let fields = result.reading.fields();
                let same_columns = columns.len() == fields.len() && columns.iter().zip(fields).all(|(c, (n, _))| c == n);
                if first || !same_columns {
                    *columns = fields.iter().map(|(n, _)| n.clone()).collect();
                    write!(writer, "_{label} Socket")?;
                    for name in columns.iter() {
                        write!(writer, " {name}")?;
                    }
                    writeln!(writer)?;
                }
                write!(writer, "_{label} {}", result.socket_id)?;
                for (_, value) in result.reading.fields() {
                    write!(writer, " {}", format_value(value))?;
                }
                writeln!(writer)
            }
            Output::Console { writer, verbose: true, .. } => {
                write!(writer, "_{label} Socket: {}", result.socket_id)?;
                for (name, value) in result.reading.fields() {
                    write!(writer, ", {name}: {}", format_value(value))?;
                }
                writeln!(writer)
            }
            Output::Json(record) => {
                insert_record_header(record);
                let class = record
                    .entry(result.query.name())
                    .or_insert_with(|| Value::Object(Map::new()));
                if !class.is_object() {
                    *class = Value::Object(Map::new());
                }
                let fields: Map<String, Value> = result
                    .reading
                    .fields()
                    .iter()
                    .map(|(n, v)| (n.clone(), v.clone()))
                    .collect();
                if let Value::Object(sockets) = class {
                    sockets.insert(format!("Socket_{}", result.socket_id), Value::Object(fields));
                }
                Ok(())
            }
        }
    }
}

/// Adds the host name and the current time (in milliseconds) at the top level of the record.
fn insert_record_header(record: &mut Map<String, Value>) {
    if !record.contains_key("host") {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| String::from("unknown"));
        record.insert(String::from("host"), Value::from(host));
    }
    let timestamp_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    record.insert(String::from("timestamp"), Value::from(timestamp_ms));
}

fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) if n.is_f64() => format!("{:.3}", n.as_f64().unwrap_or_default()),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{QueryClass, Reading};

    fn result(socket_id: u32) -> PowerQueryResult {
        PowerQueryResult {
            socket_id,
            query: QueryClass::Thermal,
            reading: Reading::new().with("temp_celsius", 41.5).with("sensor", "coretemp"),
        }
    }

    #[test]
    fn test_tabular() {
        let mut buf = Vec::new();
        let mut out = Output::console(&mut buf, false);
        assert_eq!(out.mode(), OutputMode::Tabular);
        out.emit(&result(0), true).unwrap();
        out.emit(&result(1), false).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(
            text,
            "_THERMAL Socket temp_celsius sensor\n_THERMAL 0 41.500 coretemp\n_THERMAL 1 41.500 coretemp\n"
        );
    }

    #[test]
    fn test_tabular_header_follows_the_fields() {
        let clocks = |socket_id: u32, cpus: &[u32]| PowerQueryResult {
            socket_id,
            query: QueryClass::Clocks,
            reading: cpus
                .iter()
                .fold(Reading::new(), |r, cpu| r.with(format!("cpu{cpu}_mhz"), 1000 + u64::from(*cpu))),
        };
        let mut buf = Vec::new();
        let mut out = Output::console(&mut buf, false);
        out.emit(&clocks(0, &[0, 1]), true).unwrap();
        out.emit(&clocks(1, &[2, 3, 4]), false).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(
            text,
            "_CLOCKS Socket cpu0_mhz cpu1_mhz\n_CLOCKS 0 1000 1001\n\
             _CLOCKS Socket cpu2_mhz cpu3_mhz cpu4_mhz\n_CLOCKS 1 1002 1003 1004\n"
        );
        let lines: Vec<Vec<&str>> = text.lines().map(|l| l.split(' ').collect()).collect();
        for pair in lines.chunks(2) {
            assert_eq!(pair[0].len(), pair[1].len());
        }
    }

    #[test]
    fn test_verbose() {
        let mut buf = Vec::new();
        Output::console(&mut buf, true).emit(&result(1), true).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text, "_THERMAL Socket: 1, temp_celsius: 41.500, sensor: coretemp\n");
    }

    #[test]
    fn test_json_record() {
        let mut record = Map::new();
        let mut out = Output::json(&mut record);
        out.emit(&result(0), true).unwrap();
        out.emit(&result(1), false).unwrap();
        assert!(record.contains_key("host"));
        assert!(record["timestamp"].is_u64());
        assert_eq!(record["thermal"]["Socket_1"]["temp_celsius"], 41.5);
        assert_eq!(record["thermal"]["Socket_0"]["sensor"], "coretemp");
        assert_eq!(record["thermal"].as_object().unwrap().len(), 2);
    }
}
