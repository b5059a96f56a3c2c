//! Filesystem XML filing parser
//!
//! Reads `<filing_dir>/<object_id>_public.xml` and maps it onto schedules:
//!
//! - `ReturnHeader` and every child of `ReturnData` is a schedule named after
//!   its element.
//! - Leaf children of a schedule make up the part `<Schedule>_part`.
//! - Each complex child is one instance of the group `<Schedule>_<Child>`.
//! - Nested single elements flatten into `<Parent>_<Child>` keys.
//!
//! A value with no slot in a flat record (a repeated element inside a part
//! or group instance) becomes a key error carrying its xpath.

use efile_common::types::{KeyError, ParseResult, RecordPayload, ScheduleResult};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{DocumentParser, ParseError};

const ROOT_ELEMENT: &str = "Return";
const HEADER_ELEMENT: &str = "ReturnHeader";
const DATA_ELEMENT: &str = "ReturnData";
const VERSION_ATTRIBUTE: &str = "returnVersion";

#[derive(Debug, Default)]
struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    text: String,
    children: Vec<Element>,
}

impl Element {
    fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn value(&self) -> Value {
        if self.text.is_empty() {
            Value::Null
        } else {
            Value::String(self.text.clone())
        }
    }
}

/// Parses IRS-style e-file XML returns from a directory
#[derive(Debug, Clone)]
pub struct XmlFilingParser {
    filing_dir: PathBuf,
}

impl XmlFilingParser {
    pub fn new(filing_dir: impl Into<PathBuf>) -> Self {
        Self {
            filing_dir: filing_dir.into(),
        }
    }

    pub fn path_for(&self, object_id: &str) -> PathBuf {
        self.filing_dir.join(format!("{}_public.xml", object_id))
    }

    pub fn filing_dir(&self) -> &Path {
        &self.filing_dir
    }
}

#[async_trait::async_trait]
impl DocumentParser for XmlFilingParser {
    async fn parse(&self, object_id: &str) -> Result<ParseResult, ParseError> {
        if object_id.is_empty() || object_id.contains(['/', '\\']) || object_id.contains("..") {
            return Err(ParseError::invalid(object_id, "object id is not a plain file stem"));
        }

        let path = self.path_for(object_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ParseError::FileMissing {
                    object_id: object_id.to_string(),
                    path: path.display().to_string(),
                });
            },
            Err(e) => {
                return Err(ParseError::invalid(object_id, format!("unreadable file: {}", e)));
            },
        };

        let text = String::from_utf8(bytes)
            .map_err(|_| ParseError::invalid(object_id, "file is not valid UTF-8"))?;

        let id = object_id.to_string();
        let result = tokio::task::spawn_blocking(move || parse_return(&id, &text))
            .await
            .map_err(|e| ParseError::invalid(object_id, format!("parser task failed: {}", e)))??;

        debug!(
            object_id = %object_id,
            schedules = result.schedules.len(),
            records = result.record_count(),
            key_errors = result.key_errors.len(),
            "Parsed filing"
        );

        Ok(result)
    }
}

/// Parse one return document held in memory
pub fn parse_return(object_id: &str, text: &str) -> Result<ParseResult, ParseError> {
    let root = read_tree(object_id, text.trim_start_matches('\u{feff}'))?;

    if root.name != ROOT_ELEMENT {
        return Err(ParseError::invalid(
            object_id,
            format!("root element is <{}>, expected <{}>", root.name, ROOT_ELEMENT),
        ));
    }

    let schema_version = root
        .attribute(VERSION_ATTRIBUTE)
        .map(str::to_string)
        .ok_or_else(|| ParseError::invalid(object_id, "missing returnVersion attribute"))?;

    let mut key_errors = Vec::new();
    let mut schedules = Vec::new();

    for child in &root.children {
        match child.name.as_str() {
            HEADER_ELEMENT => {
                let xpath = format!("/{}/{}", ROOT_ELEMENT, HEADER_ELEMENT);
                schedules.push(read_schedule(child, &xpath, &mut key_errors));
            },
            DATA_ELEMENT => {
                for schedule in &child.children {
                    let xpath = format!("/{}/{}/{}", ROOT_ELEMENT, DATA_ELEMENT, schedule.name);
                    schedules.push(read_schedule(schedule, &xpath, &mut key_errors));
                }
            },
            _ => {},
        }
    }

    Ok(ParseResult {
        schedules,
        schema_version,
        key_errors,
    })
}

fn read_schedule(element: &Element, xpath: &str, key_errors: &mut Vec<KeyError>) -> ScheduleResult {
    let mut schedule = ScheduleResult::new(element.name.clone());
    let mut part = RecordPayload::new();

    for child in &element.children {
        let child_xpath = format!("{}/{}", xpath, child.name);
        if child.is_leaf() {
            insert_value(&mut part, child.name.clone(), child.value(), &child_xpath, key_errors);
        } else {
            let mut instance = RecordPayload::new();
            flatten(child, "", &child_xpath, &mut instance, key_errors);
            schedule
                .groups
                .entry(format!("{}_{}", element.name, child.name))
                .or_default()
                .push(instance);
        }
    }

    if !part.is_empty() {
        schedule.parts.insert(format!("{}_part", element.name), part);
    }

    schedule
}

fn flatten(
    element: &Element,
    prefix: &str,
    xpath: &str,
    out: &mut RecordPayload,
    key_errors: &mut Vec<KeyError>,
) {
    for child in &element.children {
        let key = if prefix.is_empty() {
            child.name.clone()
        } else {
            format!("{}_{}", prefix, child.name)
        };
        let child_xpath = format!("{}/{}", xpath, child.name);

        if child.is_leaf() {
            insert_value(out, key, child.value(), &child_xpath, key_errors);
        } else {
            flatten(child, &key, &child_xpath, out, key_errors);
        }
    }
}

fn insert_value(
    out: &mut RecordPayload,
    key: String,
    value: Value,
    xpath: &str,
    key_errors: &mut Vec<KeyError>,
) {
    if out.contains_key(&key) {
        key_errors.push(KeyError::new(
            xpath,
            format!("repeated value for '{}' has no slot in a flat record", key),
        ));
    } else {
        out.insert(key, value);
    }
}

fn local_name(object_id: &str, bytes: &[u8]) -> Result<String, ParseError> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|_| ParseError::invalid(object_id, "element name is not UTF-8"))
}

fn open_element(object_id: &str, start: &BytesStart<'_>) -> Result<Element, ParseError> {
    let mut element = Element {
        name: local_name(object_id, start.local_name().as_ref())?,
        ..Default::default()
    };

    for attribute in start.attributes() {
        let attribute =
            attribute.map_err(|e| ParseError::invalid(object_id, format!("bad attribute: {}", e)))?;
        let key = local_name(object_id, attribute.key.local_name().as_ref())?;
        let value = attribute
            .unescape_value()
            .map_err(|e| ParseError::invalid(object_id, format!("bad attribute value: {}", e)))?;
        element.attributes.push((key, value.into_owned()));
    }

    Ok(element)
}

fn attach(
    object_id: &str,
    stack: &mut [Element],
    root: &mut Option<Element>,
    element: Element,
) -> Result<(), ParseError> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None if root.is_none() => *root = Some(element),
        None => return Err(ParseError::invalid(object_id, "more than one root element")),
    }
    Ok(())
}

fn read_tree(object_id: &str, text: &str) -> Result<Element, ParseError> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => stack.push(open_element(object_id, &start)?),
            Ok(Event::Empty(start)) => {
                let element = open_element(object_id, &start)?;
                attach(object_id, &mut stack, &mut root, element)?;
            },
            Ok(Event::End(_)) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| ParseError::invalid(object_id, "unbalanced closing tag"))?;
                attach(object_id, &mut stack, &mut root, element)?;
            },
            Ok(Event::Text(text)) => {
                let text = text
                    .unescape()
                    .map_err(|e| ParseError::invalid(object_id, format!("bad text: {}", e)))?;
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&text);
                }
            },
            Ok(Event::CData(data)) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            },
            Ok(Event::Eof) => break,
            Ok(_) => {},
            Err(e) => {
                return Err(ParseError::invalid(
                    object_id,
                    format!("malformed XML at byte {}: {}", reader.buffer_position(), e),
                ));
            },
        }
    }

    if !stack.is_empty() {
        return Err(ParseError::invalid(object_id, "document ends inside an element"));
    }

    root.ok_or_else(|| ParseError::invalid(object_id, "document has no root element"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<Return xmlns="http://www.irs.gov/efile" returnVersion="2016v3.0">
  <ReturnHeader binaryAttachmentCnt="0">
    <ReturnTs>2017-05-10T10:12:13-05:00</ReturnTs>
    <Filer>
      <EIN>123456789</EIN>
      <BusinessName><BusinessNameLine1Txt>Example &amp; Co</BusinessNameLine1Txt></BusinessName>
    </Filer>
  </ReturnHeader>
  <ReturnData documentCnt="2">
    <IRS990 documentId="IRS990-01">
      <TotalRevenueAmt>1200</TotalRevenueAmt>
      <WebsiteAddressTxt>example.org</WebsiteAddressTxt>
      <Form990PartVIISectionAGrp>
        <PersonNm>Ada</PersonNm>
        <AverageHoursPerWeekRt>40.00</AverageHoursPerWeekRt>
      </Form990PartVIISectionAGrp>
      <Form990PartVIISectionAGrp>
        <PersonNm>Grace</PersonNm>
        <AverageHoursPerWeekRt>10.00</AverageHoursPerWeekRt>
      </Form990PartVIISectionAGrp>
    </IRS990>
    <IRS990ScheduleB>
      <FormerNameTxt>Old</FormerNameTxt>
      <FormerNameTxt>Older</FormerNameTxt>
    </IRS990ScheduleB>
  </ReturnData>
</Return>
"#;

    #[test]
    fn test_parse_return_maps_schedules_parts_and_groups() {
        let result = parse_return("201700000000000001", SAMPLE).unwrap();

        assert_eq!(result.schema_version, "2016v3.0");
        let names: Vec<&str> = result.schedules.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["ReturnHeader", "IRS990", "IRS990ScheduleB"]);

        let header = &result.schedules[0];
        let filer = &header.groups["ReturnHeader_Filer"][0];
        assert_eq!(filer["EIN"], json!("123456789"));
        assert_eq!(filer["BusinessName_BusinessNameLine1Txt"], json!("Example & Co"));
        assert_eq!(
            header.parts["ReturnHeader_part"]["ReturnTs"],
            json!("2017-05-10T10:12:13-05:00")
        );

        let irs990 = &result.schedules[1];
        assert_eq!(irs990.parts["IRS990_part"]["TotalRevenueAmt"], json!("1200"));
        let people = &irs990.groups["IRS990_Form990PartVIISectionAGrp"];
        assert_eq!(people.len(), 2);
        assert_eq!(people[1]["PersonNm"], json!("Grace"));

        // 3 parts + 1 Filer + 2 officers
        assert_eq!(result.record_count(), 6);
    }

    #[test]
    fn test_repeated_leaf_is_reported_as_key_error() {
        let result = parse_return("1", SAMPLE).unwrap();

        assert_eq!(result.key_errors.len(), 1);
        assert_eq!(
            result.key_errors[0].xpath,
            "/Return/ReturnData/IRS990ScheduleB/FormerNameTxt"
        );
        let schedule_b = &result.schedules[2];
        assert_eq!(schedule_b.parts["IRS990ScheduleB_part"]["FormerNameTxt"], json!("Old"));
    }

    #[test]
    fn test_missing_version_is_invalid() {
        let err = parse_return("1", "<Return><ReturnData/></Return>").unwrap_err();
        assert!(matches!(err, ParseError::InvalidDocument { .. }));
    }

    #[test]
    fn test_wrong_root_and_malformed_xml_are_invalid() {
        assert!(matches!(
            parse_return("1", "<Other returnVersion=\"1\"/>"),
            Err(ParseError::InvalidDocument { .. })
        ));
        assert!(matches!(
            parse_return("1", "<Return returnVersion=\"1\"><ReturnData></Return>"),
            Err(ParseError::InvalidDocument { .. })
        ));
        assert!(matches!(parse_return("1", ""), Err(ParseError::InvalidDocument { .. })));
    }

    #[test]
    fn test_return_without_data_is_empty_but_valid() {
        let result = parse_return("1", "<Return returnVersion=\"2015v2.1\"/>").unwrap();
        assert!(result.schedules.is_empty());
        assert_eq!(result.record_count(), 0);
    }

    #[tokio::test]
    async fn test_parse_reads_file_from_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("201700000000000001_public.xml"), SAMPLE).unwrap();

        let parser = XmlFilingParser::new(dir.path());
        let result = parser.parse("201700000000000001").await.unwrap();
        assert_eq!(result.schedules.len(), 3);
    }

    #[tokio::test]
    async fn test_parse_missing_file() {
        let dir = TempDir::new().unwrap();
        let parser = XmlFilingParser::new(dir.path());

        let err = parser.parse("201700000000000002").await.unwrap_err();
        assert!(err.is_missing());
    }

    #[tokio::test]
    async fn test_parse_rejects_path_like_ids() {
        let dir = TempDir::new().unwrap();
        let parser = XmlFilingParser::new(dir.path());

        let err = parser.parse("../etc/passwd").await.unwrap_err();
        assert!(matches!(err, ParseError::InvalidDocument { .. }));
    }
}
