use std::collections::HashMap;

use quick_xml::events::Event;
use serde_json::json;

use super::xml::{attr, local_name, text, XmlEvents};
use crate::evidence::{FragmentDraft, FragmentType};
use crate::ingest::parser::{DocumentFormat, ParseError, ParseResult, Parser};

const TASK_ELEMENTS: &[&str] = &[
    "task",
    "userTask",
    "serviceTask",
    "scriptTask",
    "manualTask",
    "businessRuleTask",
    "sendTask",
    "receiveTask",
    "callActivity",
    "subProcess",
];

const GATEWAY_ELEMENTS: &[&str] = &[
    "exclusiveGateway",
    "parallelGateway",
    "inclusiveGateway",
    "eventBasedGateway",
    "complexGateway",
];

const EVENT_ELEMENTS: &[&str] = &[
    "startEvent",
    "endEvent",
    "intermediateCatchEvent",
    "intermediateThrowEvent",
    "boundaryEvent",
];

const XES_ATTRIBUTES: &[&str] = &["string", "date", "int", "float", "boolean", "id"];

/// BPMN 2.0 process models and XES event logs.
pub struct ProcessModelParser;

impl ProcessModelParser {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Default for ProcessModelParser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Parser for ProcessModelParser {
    fn supported_formats(&self) -> &[DocumentFormat] {
        &[DocumentFormat::Bpmn, DocumentFormat::Xes]
    }

    async fn parse_bytes(
        &self,
        data: &[u8],
        format: DocumentFormat,
    ) -> ParseResult<Vec<FragmentDraft>> {
        match format {
            DocumentFormat::Bpmn => parse_bpmn(data),
            DocumentFormat::Xes => parse_xes(data),
            other => Err(ParseError::NoParserAvailable(other)),
        }
    }
}

struct Flow {
    id: String,
    name: Option<String>,
    source: String,
    target: String,
}

struct Lane {
    name: String,
    members: Vec<String>,
}

fn parse_bpmn(data: &[u8]) -> ParseResult<Vec<FragmentDraft>> {
    let mut events = XmlEvents::new(data, true);
    let mut drafts = Vec::new();
    let mut names: HashMap<String, String> = HashMap::new();
    let mut flows: Vec<Flow> = Vec::new();
    let mut lanes: Vec<Lane> = Vec::new();
    let mut in_flow_node_ref = false;
    let mut saw_definitions = false;

    while let Some(event) = events.next()? {
        match event {
            Event::Start(e) | Event::Empty(e) => {
                let kind = local_name(&e);
                let id = attr(&e, b"id")?.unwrap_or_default();
                let name = attr(&e, b"name")?.filter(|n| !n.trim().is_empty());

                match kind.as_str() {
                    "definitions" => saw_definitions = true,
                    "sequenceFlow" => flows.push(Flow {
                        id,
                        name,
                        source: attr(&e, b"sourceRef")?.unwrap_or_default(),
                        target: attr(&e, b"targetRef")?.unwrap_or_default(),
                    }),
                    "lane" => lanes.push(Lane {
                        name: name.unwrap_or_else(|| id.clone()),
                        members: Vec::new(),
                    }),
                    "flowNodeRef" => in_flow_node_ref = true,
                    "participant" => {
                        if let Some(name) = name {
                            drafts.push(element_fragment("participant", &id, &name));
                        }
                    }
                    k if TASK_ELEMENTS.contains(&k)
                        || GATEWAY_ELEMENTS.contains(&k)
                        || EVENT_ELEMENTS.contains(&k) =>
                    {
                        let label = name.unwrap_or_else(|| id.clone());
                        names.insert(id.clone(), label.clone());
                        drafts.push(element_fragment(k, &id, &label));
                    }
                    _ => {}
                }
            }
            Event::Text(t) if in_flow_node_ref => {
                if let Some(lane) = lanes.last_mut() {
                    lane.members.push(text(&t)?.trim().to_string());
                }
            }
            Event::End(e) if e.local_name().as_ref() == b"flowNodeRef" => {
                in_flow_node_ref = false;
            }
            _ => {}
        }
    }

    if !saw_definitions {
        return Err(ParseError::Malformed(
            "missing BPMN definitions element".into(),
        ));
    }

    for lane in lanes {
        let members: Vec<&str> = lane
            .members
            .iter()
            .map(|id| names.get(id).map_or(id.as_str(), String::as_str))
            .collect();
        let content = if members.is_empty() {
            format!("lane: {}", lane.name)
        } else {
            format!("lane: {} ({})", lane.name, members.join(", "))
        };
        drafts.push(
            FragmentDraft::new(FragmentType::ProcessElement, content).with_metadata(json!({
                "element_type": "lane",
                "name": lane.name,
                "members": lane.members,
            })),
        );
    }

    for flow in flows {
        let source = names.get(&flow.source).unwrap_or(&flow.source);
        let target = names.get(&flow.target).unwrap_or(&flow.target);
        let content = match &flow.name {
            Some(label) => format!("{source} -> {target} [{label}]"),
            None => format!("{source} -> {target}"),
        };
        drafts.push(
            FragmentDraft::new(FragmentType::Relationship, content).with_metadata(json!({
                "element_type": "sequenceFlow",
                "element_id": flow.id,
                "source_ref": flow.source,
                "target_ref": flow.target,
            })),
        );
    }

    Ok(drafts)
}

fn element_fragment(kind: &str, id: &str, label: &str) -> FragmentDraft {
    FragmentDraft::new(FragmentType::ProcessElement, format!("{kind}: {label}")).with_metadata(
        json!({
            "element_type": kind,
            "element_id": id,
            "name": label,
        }),
    )
}

#[derive(Default)]
struct TraceEvent {
    activity: Option<String>,
    resource: Option<String>,
    timestamp: Option<String>,
}

fn parse_xes(data: &[u8]) -> ParseResult<Vec<FragmentDraft>> {
    let mut events = XmlEvents::new(data, true);
    let mut drafts = Vec::new();
    let mut trace_name: Option<String> = None;
    let mut trace_events: Vec<TraceEvent> = Vec::new();
    let mut current: Option<TraceEvent> = None;
    let mut in_trace = false;
    let mut saw_log = false;

    while let Some(event) = events.next()? {
        match event {
            Event::Start(e) | Event::Empty(e) => match local_name(&e).as_str() {
                "log" => saw_log = true,
                "trace" => {
                    in_trace = true;
                    trace_name = None;
                    trace_events.clear();
                }
                "event" if in_trace => current = Some(TraceEvent::default()),
                k if XES_ATTRIBUTES.contains(&k) => {
                    let key = attr(&e, b"key")?.unwrap_or_default();
                    let value = attr(&e, b"value")?;
                    if let Some(step) = current.as_mut() {
                        match key.as_str() {
                            "concept:name" => step.activity = value,
                            "org:resource" | "org:role" => {
                                step.resource = step.resource.take().or(value);
                            }
                            "time:timestamp" => step.timestamp = value,
                            _ => {}
                        }
                    } else if in_trace && key == "concept:name" {
                        trace_name = value;
                    }
                }
                _ => {}
            },
            Event::End(e) => match e.local_name().as_ref() {
                b"event" => {
                    if let Some(step) = current.take() {
                        trace_events.push(step);
                    }
                }
                b"trace" => {
                    in_trace = false;
                    let index = drafts.len();
                    drafts.push(trace_fragment(index, trace_name.take(), &trace_events));
                    trace_events.clear();
                }
                _ => {}
            },
            _ => {}
        }
    }

    if !saw_log {
        return Err(ParseError::Malformed("missing XES log element".into()));
    }

    Ok(drafts)
}

fn trace_fragment(index: usize, name: Option<String>, steps: &[TraceEvent]) -> FragmentDraft {
    let name = name.unwrap_or_else(|| format!("trace {}", index + 1));
    let rendered: Vec<String> = steps
        .iter()
        .filter_map(|step| {
            let activity = step.activity.as_deref()?;
            Some(match &step.resource {
                Some(resource) => format!("{activity} ({resource})"),
                None => activity.to_string(),
            })
        })
        .collect();

    FragmentDraft::new(
        FragmentType::ProcessElement,
        format!("Trace {name}: {}", rendered.join(" -> ")),
    )
    .with_metadata(json!({
        "element_type": "trace",
        "trace": name,
        "event_count": steps.len(),
        "first_timestamp": steps.iter().find_map(|s| s.timestamp.clone()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BPMN: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<bpmn:definitions xmlns:bpmn="http://www.omg.org/spec/BPMN/20100524/MODEL" id="defs">
  <bpmn:process id="invoice">
    <bpmn:laneSet>
      <bpmn:lane id="lane1" name="Finance Team">
        <bpmn:flowNodeRef>approve</bpmn:flowNodeRef>
      </bpmn:lane>
    </bpmn:laneSet>
    <bpmn:startEvent id="start" name="Invoice received"/>
    <bpmn:userTask id="approve" name="Approve Invoice"/>
    <bpmn:exclusiveGateway id="gw" name="Amount over limit?"/>
    <bpmn:serviceTask id="pay" name="Pay Invoice"/>
    <bpmn:sequenceFlow id="f1" sourceRef="start" targetRef="approve"/>
    <bpmn:sequenceFlow id="f2" sourceRef="approve" targetRef="gw" name="approved"/>
  </bpmn:process>
</bpmn:definitions>"#;

    #[tokio::test]
    async fn test_bpmn_elements_lanes_and_flows() {
        let parser = ProcessModelParser::new();
        let drafts = parser
            .parse_bytes(BPMN.as_bytes(), DocumentFormat::Bpmn)
            .await
            .unwrap();

        let contents: Vec<&str> = drafts.iter().map(|d| d.content.as_str()).collect();
        assert_eq!(
            contents,
            vec![
                "startEvent: Invoice received",
                "userTask: Approve Invoice",
                "exclusiveGateway: Amount over limit?",
                "serviceTask: Pay Invoice",
                "lane: Finance Team (Approve Invoice)",
                "Invoice received -> Approve Invoice",
                "Approve Invoice -> Amount over limit? [approved]",
            ]
        );
        assert_eq!(drafts[1].metadata["element_id"], "approve");
        assert_eq!(drafts[6].fragment_type, FragmentType::Relationship);
    }

    #[tokio::test]
    async fn test_truncated_bpmn_is_malformed() {
        let parser = ProcessModelParser::new();
        let truncated = &BPMN.as_bytes()[..BPMN.len() / 2];
        let result = parser.parse_bytes(truncated, DocumentFormat::Bpmn).await;
        assert!(matches!(result, Err(ParseError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_xes_traces() {
        let xes = br#"<?xml version="1.0"?>
<log xes.version="1.0">
  <trace>
    <string key="concept:name" value="case-1"/>
    <event>
      <string key="concept:name" value="Create Purchase Order"/>
      <string key="org:resource" value="Buyer"/>
      <date key="time:timestamp" value="2024-01-01T10:00:00Z"/>
    </event>
    <event>
      <string key="concept:name" value="Approve Purchase Order"/>
    </event>
  </trace>
  <trace>
    <event><string key="concept:name" value="Cancel Order"/></event>
  </trace>
</log>"#;

        let parser = ProcessModelParser::new();
        let drafts = parser.parse_bytes(xes, DocumentFormat::Xes).await.unwrap();

        assert_eq!(drafts.len(), 2);
        assert_eq!(
            drafts[0].content,
            "Trace case-1: Create Purchase Order (Buyer) -> Approve Purchase Order"
        );
        assert_eq!(drafts[0].metadata["first_timestamp"], "2024-01-01T10:00:00Z");
        assert_eq!(drafts[1].content, "Trace trace 2: Cancel Order");
    }
}
