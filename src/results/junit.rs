//! JUnit XML serialization, bit-exact per §4.6: a single `testsuite` under
//! `testsuites`, one `testcase` per test-variant result.

use chrono::{TimeZone, Utc};
use quick_xml::events::{BytesCData, BytesEnd, BytesStart, Event};
use quick_xml::writer::Writer;
use std::io::Cursor;

use crate::entity::EntityResult;

/// Renders `results` (test-variant entities only; see the fixture
/// visibility policy at `results::ResultsEngine`) to a JUnit XML document.
pub fn render(results: &[EntityResult]) -> Result<String, quick_xml::Error> {
    let failures = results.iter().filter(|r| r.is_failure()).count();
    let skipped = results.iter().filter(|r| r.is_skipped()).count();

    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

    let mut testsuites_start = BytesStart::new("testsuites");
    testsuites_start.push_attribute(("tests", results.len().to_string().as_str()));
    writer.write_event(Event::Start(testsuites_start))?;

    let mut testsuite_start = BytesStart::new("testsuite");
    testsuite_start.push_attribute(("tests", results.len().to_string().as_str()));
    testsuite_start.push_attribute(("failures", failures.to_string().as_str()));
    testsuite_start.push_attribute(("skipped", skipped.to_string().as_str()));
    writer.write_event(Event::Start(testsuite_start))?;

    for result in results {
        write_testcase(&mut writer, result)?;
    }

    writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
    writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

    let bytes = writer.into_inner().into_inner();
    Ok(String::from_utf8(bytes).expect("quick-xml emits valid utf-8"))
}

fn write_testcase(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    result: &EntityResult,
) -> Result<(), quick_xml::Error> {
    let status = if result.is_complete() { "run" } else { "notrun" };
    let outcome = if result.is_skipped() { "skipped" } else { "completed" };
    let elapsed = if result.is_complete() {
        (result.end - result.start).max(0)
    } else {
        0
    };

    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("name", result.entity.name.as_str()));
    testcase.push_attribute(("status", status));
    testcase.push_attribute(("result", outcome));
    testcase.push_attribute(("timestamp", iso8601(result.start).as_str()));
    testcase.push_attribute(("time", format!("{:.1}", elapsed as f64).as_str()));

    let has_body = result.is_failure() || result.is_skipped();
    if !has_body {
        writer.write_event(Event::Empty(testcase))?;
        return Ok(());
    }

    writer.write_event(Event::Start(testcase))?;

    if result.is_failure() {
        for error in &result.errors {
            let mut failure = BytesStart::new("failure");
            failure.push_attribute(("message", error.reason.as_str()));
            writer.write_event(Event::Start(failure))?;
            let stack = error.stack.clone().unwrap_or_default();
            let cdata = format!("{}:{}\n{}", error.file, error.line, stack);
            writer.write_event(Event::CData(BytesCData::new(cdata)))?;
            writer.write_event(Event::End(BytesEnd::new("failure")))?;
        }
    }

    if let Some(reason) = &result.skip_reason {
        let mut skipped = BytesStart::new("skipped");
        skipped.push_attribute(("message", reason.as_str()));
        writer.write_event(Event::Empty(skipped))?;
    }

    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    Ok(())
}

/// Renders the §4.6 literal layout `2006-01-02Z15:04:05`: the `Z` sits
/// between date and time rather than trailing a `T`-separated timestamp.
fn iso8601(unix_secs: i64) -> String {
    Utc.timestamp_opt(unix_secs, 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap())
        .format("%Y-%m-%dZ%H:%M:%S")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Entity, EntityError, EntityVariant};
    use std::path::PathBuf;

    fn entity(name: &str) -> Entity {
        Entity {
            name: name.to_string(),
            variant: EntityVariant::Test,
            pkg: "pkg".to_string(),
            desc: String::new(),
            contacts: vec![],
            data: vec![],
            software_deps: vec![],
            hardware_deps: vec![],
            timeout_secs: 30,
            bundle: "cros".to_string(),
            skip_reason: None,
        }
    }

    #[test]
    fn s1_passing_test_renders_one_clean_testcase() {
        let mut result = EntityResult::new(entity("pkg.A"), 2, PathBuf::from("out"));
        result.end = 3;
        let xml = render(&[result]).unwrap();
        assert!(xml.contains(r#"tests="1""#));
        assert!(xml.contains(r#"failures="0""#));
        assert!(xml.contains(r#"skipped="0""#));
        assert!(xml.contains(r#"name="pkg.A""#));
        assert!(xml.contains(r#"status="run""#));
        assert!(xml.contains(r#"result="completed""#));
        assert!(xml.contains(r#"time="1.0""#));
    }

    #[test]
    fn s2_failing_test_emits_failure_with_cdata() {
        let mut result = EntityResult::new(entity("pkg.B"), 2, PathBuf::from("out"));
        result.end = 5;
        result.errors.push(EntityError {
            time: 4,
            reason: "assertion failed".to_string(),
            file: "pkg_b_test.go".to_string(),
            line: 42,
            stack: Some("goroutine 1".to_string()),
        });
        let xml = render(&[result]).unwrap();
        assert!(xml.contains(r#"<failure message="assertion failed">"#));
        assert!(xml.contains("<![CDATA[pkg_b_test.go:42\ngoroutine 1]]>"));
    }

    #[test]
    fn skipped_entity_renders_skipped_element() {
        let mut result = EntityResult::new(entity("pkg.C"), 2, PathBuf::from("out"));
        result.end = 2;
        result.skip_reason = Some("missing dep".to_string());
        let xml = render(&[result]).unwrap();
        assert!(xml.contains(r#"<skipped message="missing dep"/>"#));
        assert!(xml.contains(r#"result="skipped""#));
    }

    #[test]
    fn timestamp_matches_the_z_between_date_and_time_layout() {
        assert_eq!(iso8601(0), "1970-01-01Z00:00:00");
    }
}
