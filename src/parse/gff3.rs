//! GFF3 reading and writing.
//!
//! Coordinates are converted between GFF3's 1-based closed intervals and the
//! 0-based half-open intervals used everywhere else. `ID` and `Parent`
//! attributes drive nesting and are kept as attributes; lines sharing one `ID`
//! become a single feature with discontinuous locations. Columns 2, 6 and 8
//! are kept as the `gff_source`, `gff_score` and `gff_phase` attributes.

use std::collections::HashMap;
use std::io::{BufRead, Write};

use indexmap::IndexMap;
use uuid::Uuid;

use crate::error::{ChangeError, Result};
use crate::models::{AnnotationFeature, Attributes, Location, Strand};

const SOURCE: &str = "gff_source";
const SCORE: &str = "gff_score";
const PHASE: &str = "gff_phase";

/// A `##sequence-region` pragma.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceRegion {
    pub name: String,
    pub length: u64,
}

#[derive(Debug, Default)]
pub struct Gff3Document {
    pub sequence_regions: Vec<SequenceRegion>,
    /// Top-level features in file order.
    pub features: Vec<AnnotationFeature>,
}

struct Record {
    feature: AnnotationFeature,
    parent: Option<String>,
}

fn parse_error(line: usize, message: impl Into<String>) -> ChangeError {
    ChangeError::Parse {
        format: "GFF3",
        line,
        message: message.into(),
    }
}

/// Parse a GFF3 stream. `resolve` maps a seqid to the id of its reference
/// sequence and is called once per distinct seqid.
pub fn read_gff3<R, F>(reader: R, mut resolve: F) -> Result<Gff3Document>
where
    R: BufRead,
    F: FnMut(&str) -> Result<Uuid>,
{
    let mut document = Gff3Document::default();
    let mut ref_seqs: HashMap<String, Uuid> = HashMap::new();
    let mut records: Vec<Record> = Vec::new();
    let mut by_id: HashMap<String, usize> = HashMap::new();

    for (index, line) in reader.lines().enumerate() {
        let line_number = index + 1;
        let line = line?;
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        if line.starts_with("##FASTA") {
            break;
        }
        if let Some(pragma) = line.strip_prefix("##sequence-region") {
            let parts: Vec<&str> = pragma.split_whitespace().collect();
            if let [name, _, end] = parts[..] {
                let length = end
                    .parse()
                    .map_err(|_| parse_error(line_number, "bad sequence-region end"))?;
                document.sequence_regions.push(SequenceRegion {
                    name: name.to_string(),
                    length,
                });
            }
            continue;
        }
        if line.starts_with('#') {
            continue;
        }

        let columns: Vec<&str> = line.split('\t').collect();
        if columns.len() != 9 {
            return Err(parse_error(
                line_number,
                format!("expected 9 tab-separated columns, found {}", columns.len()),
            ));
        }
        let start: u64 = columns[3]
            .parse()
            .map_err(|_| parse_error(line_number, format!("bad start \"{}\"", columns[3])))?;
        let end: u64 = columns[4]
            .parse()
            .map_err(|_| parse_error(line_number, format!("bad end \"{}\"", columns[4])))?;
        if start == 0 || end < start {
            return Err(parse_error(line_number, format!("bad interval {}..{}", start, end)));
        }

        let ref_seq = match ref_seqs.get(columns[0]) {
            Some(id) => *id,
            None => {
                let id = resolve(columns[0])?;
                ref_seqs.insert(columns[0].to_string(), id);
                id
            }
        };

        let mut attributes = parse_attributes(columns[8]);
        for (key, value) in [(SOURCE, columns[1]), (SCORE, columns[5]), (PHASE, columns[7])] {
            if value != "." {
                attributes.insert(key.to_string(), vec![value.to_string()]);
            }
        }
        let gff_id = attributes.get("ID").and_then(|v| v.first()).cloned();
        let parent = attributes.get("Parent").and_then(|v| v.first()).cloned();

        let (min, max) = (start - 1, end);
        if let Some(&existing) = gff_id.as_ref().and_then(|id| by_id.get(id)) {
            let record: &mut Record = &mut records[existing];
            if record.parent != parent {
                return Err(parse_error(line_number, "lines sharing an ID must share a Parent"));
            }
            let feature = &mut record.feature;
            if feature.discontinuous_locations.is_empty() {
                feature.discontinuous_locations.push(Location {
                    start: feature.min,
                    end: feature.max,
                });
            }
            feature.discontinuous_locations.push(Location { start: min, end: max });
            feature.min = feature.min.min(min);
            feature.max = feature.max.max(max);
            continue;
        }

        let mut feature = AnnotationFeature::new(ref_seq, columns[2], min, max);
        feature.strand = Strand::from_symbol(columns[6]);
        feature.attributes = attributes;
        if let Some(id) = &gff_id {
            by_id.insert(id.clone(), records.len());
        }
        records.push(Record { feature, parent });
    }

    let mut children: Vec<Vec<usize>> = vec![Vec::new(); records.len()];
    let mut roots = Vec::new();
    for (index, record) in records.iter().enumerate() {
        match &record.parent {
            Some(parent) => {
                let parent_index = by_id.get(parent).ok_or_else(|| {
                    parse_error(0, format!("Parent \"{}\" is never defined", parent))
                })?;
                children[*parent_index].push(index);
            }
            None => roots.push(index),
        }
    }

    let mut built = 0;
    for root in roots {
        document
            .features
            .push(build(&records, &children, root, &mut built));
    }
    if built != records.len() {
        return Err(parse_error(0, "circular Parent references"));
    }
    Ok(document)
}

fn build(
    records: &[Record],
    children: &[Vec<usize>],
    index: usize,
    built: &mut usize,
) -> AnnotationFeature {
    *built += 1;
    let mut feature = records[index].feature.clone();
    feature.discontinuous_locations.sort();
    feature.children = children[index]
        .iter()
        .map(|&child| {
            let child = build(records, children, child, built);
            (child.id, child)
        })
        .collect::<IndexMap<_, _>>();
    feature
}

fn column<'a>(attributes: &'a Attributes, key: &str) -> &'a str {
    attributes
        .get(key)
        .and_then(|values| values.first())
        .map(String::as_str)
        .unwrap_or(".")
}

fn parse_attributes(field: &str) -> Attributes {
    let mut attributes = Attributes::new();
    if field == "." {
        return attributes;
    }
    for pair in field.split(';').filter(|pair| !pair.trim().is_empty()) {
        let (key, values) = pair.split_once('=').unwrap_or((pair, ""));
        let values = values
            .split(',')
            .filter(|value| !value.is_empty())
            .map(unescape);
        attributes
            .entry(unescape(key.trim()))
            .or_default()
            .extend(values);
    }
    attributes
}

fn unescape(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|hex| u8::from_str_radix(hex, 16).ok()) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ';' | '=' | ',' | '&' | '%' | '\t' | '\n' | '\r' => {
                out.push_str(&format!("%{:02X}", c as u32))
            }
            _ => out.push(c),
        }
    }
    out
}

/// Write top-level features as GFF3. `ref_seq_name` names the seqid of a
/// reference sequence id.
pub fn write_gff3<W, F>(
    mut writer: W,
    regions: &[SequenceRegion],
    features: &[AnnotationFeature],
    ref_seq_name: F,
) -> Result<()>
where
    W: Write,
    F: Fn(Uuid) -> String,
{
    writeln!(writer, "##gff-version 3")?;
    for region in regions {
        writeln!(writer, "##sequence-region {} 1 {}", region.name, region.length)?;
    }
    for feature in features {
        write_feature(&mut writer, feature, None, &ref_seq_name)?;
        writeln!(writer, "###")?;
    }
    writer.flush()?;
    Ok(())
}

fn write_feature<W, F>(
    writer: &mut W,
    feature: &AnnotationFeature,
    parent_id: Option<&str>,
    ref_seq_name: &F,
) -> Result<()>
where
    W: Write,
    F: Fn(Uuid) -> String,
{
    let gff_id = feature
        .attributes
        .get("ID")
        .and_then(|v| v.first())
        .cloned()
        .unwrap_or_else(|| feature.id.to_string());

    let mut attributes = vec![format!("ID={}", escape(&gff_id))];
    if let Some(parent) = parent_id {
        attributes.push(format!("Parent={}", escape(parent)));
    }
    for (key, values) in &feature.attributes {
        if matches!(key.as_str(), "ID" | "Parent" | SOURCE | SCORE | PHASE) {
            continue;
        }
        let values: Vec<String> = values.iter().map(|v| escape(v)).collect();
        attributes.push(format!("{}={}", escape(key), values.join(",")));
    }
    let attributes = attributes.join(";");
    let strand = feature.strand.map(|s| s.symbol()).unwrap_or('.');

    let intervals = if feature.discontinuous_locations.is_empty() {
        vec![Location {
            start: feature.min,
            end: feature.max,
        }]
    } else {
        feature.discontinuous_locations.clone()
    };
    for location in intervals {
        writeln!(
            writer,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            ref_seq_name(feature.ref_seq),
            column(&feature.attributes, SOURCE),
            feature.feature_type,
            location.start + 1,
            location.end,
            column(&feature.attributes, SCORE),
            strand,
            column(&feature.attributes, PHASE),
            attributes
        )?;
    }
    for child in feature.children.values() {
        write_feature(writer, child, Some(&gff_id), ref_seq_name)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const GENE: &str = "##gff-version 3
##sequence-region ctgA 1 50000
ctgA\texample\tgene\t1050\t9000\t.\t+\t.\tID=EDEN;Name=EDEN;Note=protein kinase
ctgA\texample\tmRNA\t1050\t9000\t.\t+\t.\tID=EDEN.1;Parent=EDEN
ctgA\texample\texon\t1050\t1500\t.\t+\t.\tParent=EDEN.1
ctgA\texample\tCDS\t1201\t1500\t.\t+\t0\tID=cds1;Parent=EDEN.1
ctgA\texample\tCDS\t3000\t3902\t.\t+\t0\tID=cds1;Parent=EDEN.1
###
";

    fn read(input: &str) -> Gff3Document {
        let ref_seq = Uuid::nil();
        read_gff3(input.as_bytes(), |_| Ok(ref_seq)).unwrap()
    }

    #[test]
    fn builds_nested_features() {
        let document = read(GENE);
        assert_eq!(
            document.sequence_regions,
            vec![SequenceRegion {
                name: "ctgA".to_string(),
                length: 50000
            }]
        );
        assert_eq!(document.features.len(), 1);

        let gene = &document.features[0];
        assert_eq!((gene.min, gene.max), (1049, 9000));
        assert_eq!(gene.strand, Some(Strand::Forward));
        assert_eq!(gene.attributes["Note"], vec!["protein kinase".to_string()]);
        assert_eq!(gene.attributes[SOURCE], vec!["example".to_string()]);

        let mrna = gene.children.values().next().unwrap();
        assert_eq!(mrna.children.len(), 2);
    }

    #[test]
    fn merges_lines_sharing_an_id() {
        let document = read(GENE);
        let mrna = document.features[0].children.values().next().unwrap();
        let cds = mrna.children.values().find(|f| f.feature_type == "CDS").unwrap();
        assert_eq!((cds.min, cds.max), (1200, 3902));
        assert_eq!(
            cds.discontinuous_locations,
            vec![
                Location {
                    start: 1200,
                    end: 1500
                },
                Location {
                    start: 2999,
                    end: 3902
                },
            ]
        );
    }

    #[test]
    fn reports_bad_lines() {
        let err = read_gff3("ctgA\tx\tgene\t10\n".as_bytes(), |_| Ok(Uuid::nil())).unwrap_err();
        assert!(matches!(err, ChangeError::Parse { line: 1, .. }));

        let err = read_gff3(
            "ctgA\tx\tgene\t10\t5\t.\t+\t.\tID=a\n".as_bytes(),
            |_| Ok(Uuid::nil()),
        )
        .unwrap_err();
        assert!(matches!(err, ChangeError::Parse { .. }));

        let err = read_gff3(
            "ctgA\tx\texon\t10\t50\t.\t+\t.\tParent=nowhere\n".as_bytes(),
            |_| Ok(Uuid::nil()),
        )
        .unwrap_err();
        assert!(matches!(err, ChangeError::Parse { .. }));
    }

    #[test]
    fn written_files_read_back_to_the_same_shape() {
        let document = read(GENE);
        let mut out = Vec::new();
        write_gff3(&mut out, &document.sequence_regions, &document.features, |_| {
            "ctgA".to_string()
        })
        .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Note=protein kinase"));

        let again = read(&text);
        let (a, b) = (&document.features[0], &again.features[0]);
        assert_eq!((a.min, a.max, &a.feature_type), (b.min, b.max, &b.feature_type));
        assert_eq!(a.all_ids().len(), b.all_ids().len());
        let cds = |f: &AnnotationFeature| {
            f.children.values().next().unwrap().children.values().last().unwrap().discontinuous_locations.clone()
        };
        assert_eq!(cds(a), cds(b));
    }

    #[test]
    fn escapes_reserved_characters() {
        assert_eq!(escape("a;b=c,d"), "a%3Bb%3Dc%2Cd");
        assert_eq!(unescape("a%3Bb%3Dc%2Cd"), "a;b=c,d");
        assert_eq!(unescape("100%"), "100%");
    }
}
