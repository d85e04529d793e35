//! Turning response events into operator results and result events.

use chrono::Utc;
use serde_json::{Map, Value};

use super::{ExecutorOptions, ProtocolType, Request, TEMPLATE_INFO_KEY, TEMPLATE_PATH_KEY};
use crate::dsl;
use crate::interactsh::{self, RequestData};
use crate::output::{InternalEvent, InternalWrappedEvent, ResultEvent};

/// Run `request`'s operators over `event` and synthesize its result events.
pub fn create_event(request: &dyn Request, options: &ExecutorOptions, event: InternalEvent) -> InternalWrappedEvent {
    create_event_with_payload(request, options, event, &Map::new())
}

/// Like [`create_event`], recording the payload combination that produced `event`.
pub fn create_event_with_payload(
    request: &dyn Request,
    options: &ExecutorOptions,
    mut event: InternalEvent,
    payload: &Map<String, Value>,
) -> InternalWrappedEvent {
    for (key, value) in options.template_fields() {
        event.entry(key).or_insert(value);
    }
    let operators = request.operators();
    let result = if operators.is_empty() {
        None
    } else {
        operators.execute(&mut event, |d, m| request.match_part(d, m), |d, e| request.extract(d, e))
    };

    let mut wrapped = InternalWrappedEvent::new(event);
    if let Some(mut result) = result {
        result.payload_values = payload.clone();
        wrapped.operators_result = Some(result);
        wrapped.results = request.make_result_event(&wrapped);
    }
    wrapped
}

/// Like [`create_event_with_payload`], except that when the request embedded
/// interaction URLs and its matchers read interaction data, the event is
/// parked with the interaction client and evaluated when the callback arrives.
pub fn create_event_with_interactions(
    request: &dyn Request,
    options: &ExecutorOptions,
    mut event: InternalEvent,
    payload: &Map<String, Value>,
    interaction_urls: &[String],
) -> InternalWrappedEvent {
    let deferred = options
        .interactsh
        .as_ref()
        .filter(|_| !interaction_urls.is_empty() && interactsh::has_interaction_matchers(request.operators()));
    let Some(client) = deferred else {
        return create_event_with_payload(request, options, event, payload);
    };

    for (key, value) in options.template_fields() {
        event.entry(key).or_insert(value);
    }
    client.register(
        interaction_urls,
        RequestData {
            event: event.clone(),
            operators: request.operators().clone(),
            protocol: request.protocol(),
            default_part: request.default_part(),
        },
    );
    let mut wrapped = InternalWrappedEvent::new(event);
    wrapped.uses_interactsh = true;
    wrapped
}

/// One result per named matcher that matched, else one per named extractor,
/// else a single result. Events carrying only dynamic values and no match
/// produce nothing.
pub fn make_default_result_event<F>(wrapped: &InternalWrappedEvent, make_item: F) -> Vec<ResultEvent>
where
    F: Fn(&InternalWrappedEvent) -> ResultEvent,
{
    let Some(result) = &wrapped.operators_result else {
        return Vec::new();
    };
    if !result.dynamic_values.is_empty() && !result.matched {
        return Vec::new();
    }

    if !result.matches.is_empty() {
        return result
            .matches
            .keys()
            .map(|name| {
                let mut item = make_item(wrapped);
                item.matcher_name = Some(name.clone());
                item
            })
            .collect();
    }
    if !result.extracts.is_empty() {
        return result
            .extracts
            .iter()
            .map(|(name, values)| {
                let mut item = make_item(wrapped);
                item.extractor_name = Some(name.clone());
                item.extracted_results = values.clone();
                item
            })
            .collect();
    }
    vec![make_item(wrapped)]
}

fn non_empty(text: String) -> Option<String> {
    (!text.is_empty()).then_some(text)
}

/// Result item built from the common event keys: `host`, `matched`,
/// `request`, `response`, `ip` and the template metadata.
pub fn default_result_item(wrapped: &InternalWrappedEvent, protocol: ProtocolType) -> ResultEvent {
    let event = &wrapped.internal_event;
    let result = wrapped.operators_result.as_ref();
    let host = wrapped.field("host");
    let matched_at = non_empty(wrapped.field("matched")).unwrap_or_else(|| host.clone());

    ResultEvent {
        template_id: wrapped.field(super::TEMPLATE_ID_KEY),
        template_path: event.get(TEMPLATE_PATH_KEY).map(dsl::to_text),
        info: event
            .get(TEMPLATE_INFO_KEY)
            .and_then(|info| serde_json::from_value(info.clone()).ok())
            .unwrap_or_default(),
        matcher_name: None,
        extractor_name: None,
        protocol: protocol.as_str().to_string(),
        host,
        matched_at,
        extracted_results: result.map(|r| r.output_extracts.clone()).unwrap_or_default(),
        request: non_empty(wrapped.field("request")),
        response: non_empty(wrapped.field("response")),
        ip: non_empty(wrapped.field("ip")),
        payload: result.map(|r| r.payload_values.clone()).unwrap_or_default(),
        interaction: None,
        timestamp: Utc::now(),
        matcher_status: result.map(|r| r.matched).unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Severity;
    use crate::operators::OperatorsResult;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn wrapped(result: OperatorsResult) -> InternalWrappedEvent {
        let mut wrapped = InternalWrappedEvent::new(
            json!({
                "template-id": "t1",
                "template-info": {"name": "Test", "severity": "medium"},
                "host": "a.test",
                "matched": "http://a.test/x",
                "response": "HTTP/1.1 200 OK",
            })
            .as_object()
            .cloned()
            .unwrap(),
        );
        wrapped.operators_result = Some(result);
        wrapped
    }

    fn make(wrapped: &InternalWrappedEvent) -> Vec<ResultEvent> {
        make_default_result_event(wrapped, |w| default_result_item(w, ProtocolType::Http))
    }

    #[test]
    fn test_one_event_per_matcher() {
        let result = OperatorsResult {
            matched: true,
            matches: BTreeMap::from([("a".into(), vec![]), ("b".into(), vec![])]),
            ..Default::default()
        };
        let events = make(&wrapped(result));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].matcher_name.as_deref(), Some("a"));
        assert_eq!(events[0].info.severity, Severity::Medium);
        assert_eq!(events[0].matched_at, "http://a.test/x");
        assert!(events[0].matcher_status);
    }

    #[test]
    fn test_one_event_per_extractor() {
        let result = OperatorsResult {
            extracted: true,
            extracts: BTreeMap::from([("version".into(), vec!["1.2".into()])]),
            output_extracts: vec!["1.2".into()],
            ..Default::default()
        };
        let events = make(&wrapped(result));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].extractor_name.as_deref(), Some("version"));
        assert_eq!(events[0].extracted_results, vec!["1.2"]);
    }

    #[test]
    fn test_dynamic_only_is_silent() {
        let result = OperatorsResult {
            extracted: true,
            dynamic_values: BTreeMap::from([("token".into(), vec!["x".into()])]),
            ..Default::default()
        };
        assert!(make(&wrapped(result)).is_empty());
    }

    #[test]
    fn test_unnamed_match_gives_single_event() {
        let events = make(&wrapped(OperatorsResult { matched: true, ..Default::default() }));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].response.as_deref(), Some("HTTP/1.1 200 OK"));
        assert!(events[0].request.is_none());
    }

    #[test]
    fn test_no_operator_result_gives_nothing() {
        assert!(make(&InternalWrappedEvent::default()).is_empty());
    }
}
