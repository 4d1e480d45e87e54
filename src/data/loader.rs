use anyhow::{anyhow, bail, Context, Result};
use csv::ReaderBuilder;
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::{debug, info};

/// Supported file formats
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FileFormat {
    Csv,
    GzippedCsv,
}

impl FileFormat {
    /// Detect file format from path
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let ext = path.extension().and_then(|e| e.to_str());
        let stem = path.file_stem().and_then(|s| s.to_str());

        match (ext, stem) {
            (Some("gz"), Some(stem)) if stem.ends_with(".csv") => Ok(FileFormat::GzippedCsv),
            (Some("csv"), _) => Ok(FileFormat::Csv),
            _ => Err(anyhow!("Unsupported file format: {:?}", path)),
        }
    }

    pub fn is_gzipped(&self) -> bool {
        matches!(self, FileFormat::GzippedCsv)
    }
}

/// Molecules and labels read from a partition file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRecords {
    pub smiles: Vec<String>,
    pub lbs: Vec<Vec<f32>>,
    /// `None` when the file has no mask column or every mask cell is empty
    pub masks: Option<Vec<Vec<f32>>>,
}

impl RawRecords {
    pub fn len(&self) -> usize {
        self.smiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.smiles.is_empty()
    }
}

/// Reader for `smiles,labels,masks` partition files
#[derive(Debug, Default)]
pub struct CsvLoader;

impl CsvLoader {
    pub fn new() -> Self {
        Self
    }

    /// Load records from file
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<RawRecords> {
        let path = path.as_ref();
        if !path.is_file() {
            bail!("File {:?} does not exist!", path);
        }
        info!("Loading dataset {:?}", path);

        let format = FileFormat::from_path(path)?;
        debug!("Detected file format: {:?}", format);

        let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
        let records = if format.is_gzipped() {
            self.parse_records(BufReader::new(GzDecoder::new(file)))
        } else {
            self.parse_records(BufReader::new(file))
        }
        .with_context(|| format!("Failed to parse {:?}", path))?;

        info!("Loaded {} molecules", records.len());
        Ok(records)
    }

    /// Parse records from reader
    fn parse_records<R: Read>(&self, reader: R) -> Result<RawRecords> {
        let mut csv_reader = ReaderBuilder::new().has_headers(true).from_reader(reader);

        let headers = csv_reader.headers()?.clone();
        let column = |name: &str| headers.iter().position(|h| h == name);
        let smiles_idx = column("smiles").context("Missing required column: smiles")?;
        let lbs_idx = column("labels").context("Missing required column: labels")?;
        let masks_idx = column("masks");

        let mut records = RawRecords::default();
        let mut raw_masks: Vec<Option<Vec<f32>>> = Vec::new();

        for (row, result) in csv_reader.records().enumerate() {
            // header is line 1
            let line = row + 2;
            let record = result.with_context(|| format!("Failed to read CSV line {}", line))?;

            let smiles = record.get(smiles_idx).unwrap_or("").trim().to_string();
            let lbs = parse_list_literal(record.get(lbs_idx).unwrap_or(""))
                .with_context(|| format!("Malformed `labels` at line {}", line))?;

            let masks = match masks_idx.and_then(|idx| record.get(idx)) {
                Some(cell) if !cell.trim().is_empty() => {
                    let masks = parse_list_literal(cell)
                        .with_context(|| format!("Malformed `masks` at line {}", line))?;
                    if masks.len() != lbs.len() {
                        bail!(
                            "Line {}: {} mask entries for {} labels",
                            line,
                            masks.len(),
                            lbs.len()
                        );
                    }
                    Some(masks)
                }
                _ => None,
            };

            if let Some(first) = records.lbs.first() {
                if first.len() != lbs.len() {
                    bail!("Line {}: expected {} labels, found {}", line, first.len(), lbs.len());
                }
            }

            records.smiles.push(smiles);
            records.lbs.push(lbs);
            raw_masks.push(masks);
        }

        records.masks = if raw_masks.iter().all(Option::is_none) {
            None
        } else {
            // rows without a mask cell are fully observed
            Some(
                raw_masks
                    .into_iter()
                    .zip(&records.lbs)
                    .map(|(m, lbs)| m.unwrap_or_else(|| vec![1.0; lbs.len()]))
                    .collect(),
            )
        };

        Ok(records)
    }
}

/// Parse a stringified list literal such as `[1, 0, 0.5]` or a bare scalar
///
/// `nan`, `None` and `null` entries become `f32::NAN`; `True`/`False` become 1 and 0.
pub fn parse_list_literal(text: &str) -> Result<Vec<f32>> {
    let text = text.trim();
    if text.is_empty() {
        bail!("Empty literal");
    }

    let inner = match (text.starts_with('['), text.ends_with(']')) {
        (true, true) => &text[1..text.len() - 1],
        (false, false) => text,
        _ => bail!("Unbalanced brackets in {:?}", text),
    };

    // A single trailing comma is allowed, as in `[1, 0,]`
    let inner = inner.trim();
    let (inner, trailing_comma) = match inner.strip_suffix(',') {
        Some(rest) => (rest, true),
        None => (inner, false),
    };
    if inner.trim().is_empty() {
        if trailing_comma {
            bail!("Invalid literal {:?}", text);
        }
        return Ok(Vec::new());
    }

    inner
        .split(',')
        .map(|item| {
            let item = item.trim();
            match item {
                "nan" | "NaN" | "None" | "null" => Ok(f32::NAN),
                "True" | "true" => Ok(1.0),
                "False" | "false" => Ok(0.0),
                _ => item
                    .parse::<f32>()
                    .map_err(|_| anyhow!("Invalid number {:?} in {:?}", item, text)),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_file_format_detection() {
        assert_eq!(FileFormat::from_path("train.csv").unwrap(), FileFormat::Csv);
        assert_eq!(FileFormat::from_path("train.csv.gz").unwrap(), FileFormat::GzippedCsv);
        assert!(FileFormat::from_path("train.tsv").is_err());
    }

    #[test]
    fn test_parse_list_literal() {
        assert_eq!(parse_list_literal("[1, 0, 1]").unwrap(), vec![1.0, 0.0, 1.0]);
        assert_eq!(parse_list_literal("0.25").unwrap(), vec![0.25]);
        assert_eq!(parse_list_literal("[True, False]").unwrap(), vec![1.0, 0.0]);
        assert!(parse_list_literal("[nan]").unwrap()[0].is_nan());
        assert!(parse_list_literal("[]").unwrap().is_empty());
        assert!(parse_list_literal("[1, x]").is_err());
        assert!(parse_list_literal("[1, 2").is_err());
    }

    #[test]
    fn test_parse_list_literal_trailing_comma() {
        assert_eq!(parse_list_literal("[1, 0,]").unwrap(), vec![1.0, 0.0]);
        assert_eq!(parse_list_literal("[0.5, ]").unwrap(), vec![0.5]);
        assert!(parse_list_literal("[1,,]").is_err());
        assert!(parse_list_literal("[,]").is_err());
    }

    #[test]
    fn test_parse_with_masks() {
        let csv_data = "smiles,labels,masks\nCCO,\"[1, 0]\",\"[1, 0]\"\nc1ccccc1,\"[0, 1]\",\"[1, 1]\"";
        let records = CsvLoader::new().parse_records(Cursor::new(csv_data)).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records.smiles[0], "CCO");
        assert_eq!(records.lbs[1], vec![0.0, 1.0]);
        assert_eq!(records.masks.unwrap()[0], vec![1.0, 0.0]);
    }

    #[test]
    fn test_parse_empty_masks_column() {
        let csv_data = "smiles,labels,masks\nCCO,[1],\nCCN,[0],";
        let records = CsvLoader::new().parse_records(Cursor::new(csv_data)).unwrap();
        assert!(records.masks.is_none());
    }

    #[test]
    fn test_parse_without_masks_column() {
        let csv_data = "smiles,labels\nCCO,0.5\nCCN,1.5";
        let records = CsvLoader::new().parse_records(Cursor::new(csv_data)).unwrap();
        assert_eq!(records.lbs, vec![vec![0.5], vec![1.5]]);
        assert!(records.masks.is_none());
    }

    #[test]
    fn test_malformed_labels() {
        let csv_data = "smiles,labels\nCCO,\"[1, ?]\"";
        let err = CsvLoader::new().parse_records(Cursor::new(csv_data)).unwrap_err();
        assert!(format!("{:#}", err).contains("line 2"));
    }

    #[test]
    fn test_missing_file() {
        let err = CsvLoader::new().load("does/not/exist.csv").unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
