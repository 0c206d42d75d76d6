//! JUnit XML report parsing.
//!
//! Reads the `<testcase>` elements of a JUnit XML file, whatever the nesting
//! (`<testsuites>` or a bare `<testsuite>`):
//!
//! ```xml
//! <testsuite name="io.harness.CartTest" tests="2">
//!   <testcase classname="io.harness.CartTest" name="adds" time="0.012"/>
//!   <testcase classname="io.harness.CartTest" name="removes" time="0.100">
//!     <failure message="expected 1 but was 2">...</failure>
//!   </testcase>
//! </testsuite>
//! ```

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde::Serialize;

/// Outcome of one test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseStatus {
    Passed,
    Failed,
    Error,
    Skipped,
}

/// One `<testcase>` of a report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestCaseReport {
    pub classname: String,
    pub name: String,
    pub time_secs: f64,
    pub status: CaseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TestCaseReport {
    fn from_element(e: &BytesStart<'_>) -> Result<Self, String> {
        Ok(Self {
            classname: attr(e, b"classname")?.unwrap_or_default(),
            name: attr(e, b"name")?.unwrap_or_default(),
            time_secs: attr(e, b"time")?
                .and_then(|t| t.replace(',', "").parse().ok())
                .unwrap_or(0.0),
            status: CaseStatus::Passed,
            message: None,
        })
    }

    fn mark(&mut self, e: &BytesStart<'_>) -> Result<(), String> {
        let status = match e.name().as_ref() {
            b"failure" => CaseStatus::Failed,
            b"error" => CaseStatus::Error,
            b"skipped" => CaseStatus::Skipped,
            _ => return Ok(()),
        };
        // A failure or error outranks a skip marker.
        if self.status == CaseStatus::Passed || status != CaseStatus::Skipped {
            self.status = status;
            self.message = attr(e, b"message")?;
        }
        Ok(())
    }
}

fn attr(e: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>, String> {
    let Some(attribute) = e.try_get_attribute(key).map_err(|err| err.to_string())? else {
        return Ok(None);
    };
    let value = attribute.unescape_value().map_err(|err| err.to_string())?;
    Ok(Some(value.into_owned()))
}

/// Parses the test cases of a JUnit XML document.
///
/// Returns the parser's message on malformed XML.
pub fn parse_junit(xml: &str) -> Result<Vec<TestCaseReport>, String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut cases = Vec::new();
    let mut current: Option<TestCaseReport> = None;

    loop {
        match reader.read_event().map_err(|e| {
            format!("at byte {}: {}", reader.buffer_position(), e)
        })? {
            Event::Start(e) if e.name().as_ref() == b"testcase" => {
                current = Some(TestCaseReport::from_element(&e)?);
            }
            Event::Empty(e) if e.name().as_ref() == b"testcase" => {
                cases.push(TestCaseReport::from_element(&e)?);
            }
            Event::Start(e) | Event::Empty(e) => {
                if let Some(case) = current.as_mut() {
                    case.mark(&e)?;
                }
            }
            Event::End(e) if e.name().as_ref() == b"testcase" => {
                if let Some(case) = current.take() {
                    cases.push(case);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if current.is_some() {
        return Err("unterminated <testcase> element".to_string());
    }
    Ok(cases)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<testsuites>
  <testsuite name="io.a.CartTest" tests="4">
    <testcase classname="io.a.CartTest" name="adds" time="0.012"/>
    <testcase classname="io.a.CartTest" name="removes" time="1,200.5">
      <failure message="expected &lt;1&gt;">stack</failure>
    </testcase>
    <testcase classname="io.a.CartTest" name="clears">
      <skipped/>
    </testcase>
    <testcase classname="io.a.CartTest" name="boom">
      <error message="NPE" type="java.lang.NullPointerException"/>
    </testcase>
  </testsuite>
</testsuites>"#;

    #[test]
    fn test_parse_statuses() {
        let cases = parse_junit(REPORT).unwrap();
        assert_eq!(cases.len(), 4);
        assert_eq!(cases[0].status, CaseStatus::Passed);
        assert_eq!(cases[0].time_secs, 0.012);
        assert_eq!(cases[1].status, CaseStatus::Failed);
        assert_eq!(cases[1].message.as_deref(), Some("expected <1>"));
        assert_eq!(cases[1].time_secs, 1200.5);
        assert_eq!(cases[2].status, CaseStatus::Skipped);
        assert_eq!(cases[3].status, CaseStatus::Error);
        assert_eq!(cases[3].message.as_deref(), Some("NPE"));
    }

    #[test]
    fn test_bare_testsuite() {
        let cases = parse_junit(
            r#"<testsuite><testcase classname="t" name="a" time="1"/></testsuite>"#,
        )
        .unwrap();
        assert_eq!(cases[0].classname, "t");
    }

    #[test]
    fn test_malformed_xml() {
        assert!(parse_junit("<testsuite><testcase name=\"a\"></testsuite>").is_err());
    }
}
