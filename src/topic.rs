//! Wire-exact topic surface shared by the provisioning engine, the twin
//! adapter and the connection orchestrator.

/// Prefix of every provisioning service response.
pub const PROVISIONING_RESPONSE_PREFIX: &str = "$dps/registrations/res/";

/// Wildcard filter covering all provisioning responses.
pub const PROVISIONING_RESPONSE_FILTER: &str = "$dps/registrations/res/#";

/// Registration request topic, correlation id fixed at 1.
pub const REGISTRATION_PUT: &str = "$dps/registrations/PUT/iotdps-register/?$rid=1";

/// Prefix of every twin control-plane response.
pub const TWIN_RESPONSE_PREFIX: &str = "$iothub/twin/res/";

/// Wildcard filter covering all twin responses.
pub const TWIN_RESPONSE_FILTER: &str = "$iothub/twin/res/#";

/// Prefix of inbound desired-property patches.
pub const TWIN_DESIRED_PREFIX: &str = "$iothub/twin/PATCH/properties/desired/";

/// Wildcard filter covering inbound desired-property patches.
pub const TWIN_DESIRED_FILTER: &str = "$iothub/twin/PATCH/properties/desired/#";

/// Prefix shared by all twin control-plane traffic.
pub const TWIN_PREFIX: &str = "$iothub/twin/";

/// Assignment status poll topic, correlation id fixed at 2.
pub fn registration_status_get(operation_id: &str) -> String {
    format!("$dps/registrations/GET/iotdps-get-operationstatus/?$rid=2&operationId={operation_id}")
}

pub fn twin_get(rid: u64) -> String {
    format!("$iothub/twin/GET/?$rid={rid}")
}

pub fn twin_reported_patch(rid: u64) -> String {
    format!("$iothub/twin/PATCH/properties/reported/?$rid={rid}")
}

/// Device-to-cloud telemetry topic.
pub fn telemetry(device_id: &str) -> String {
    format!("devices/{device_id}/messages/events/")
}

/// Cloud-to-device command filter.
pub fn commands(device_id: &str) -> String {
    format!("devices/{device_id}/messages/devicebound/#")
}

/// Extracts the `$rid` correlation id from a control-plane topic.
pub fn request_id(topic: &str) -> Option<&str> {
    let (_, tail) = topic.split_once("$rid=")?;
    let end = tail.find(['&', '/', '?']).unwrap_or(tail.len());
    let rid = &tail[..end];
    (!rid.is_empty()).then_some(rid)
}

/// Extracts the HTTP-style status code from a twin response topic of the
/// form `$iothub/twin/res/{status}/?$rid={rid}`.
pub fn response_status(topic: &str) -> Option<u16> {
    let tail = topic.strip_prefix(TWIN_RESPONSE_PREFIX)?;
    let end = tail.find('/').unwrap_or(tail.len());
    tail[..end].parse().ok()
}

/// Matches a topic name against a subscription filter with `+` and `#`
/// wildcard support.
pub fn matches_filter(topic: &str, filter: &str) -> bool {
    if topic.is_empty() {
        return false;
    }
    if topic == filter || filter == "#" {
        return true;
    }

    let mut topic_parts = topic.split('/');
    let mut filter_parts = filter.split('/').peekable();

    loop {
        match (topic_parts.next(), filter_parts.next()) {
            (None, None) => return true,
            (_, Some("#")) => return filter_parts.peek().is_none(),
            (None, Some(_)) | (Some(_), None) => return false,
            (Some(level), Some(pattern)) => {
                if pattern != "+" && pattern != level {
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_wire_exact_topics() {
        assert_eq!(
            registration_status_get("op-1"),
            "$dps/registrations/GET/iotdps-get-operationstatus/?$rid=2&operationId=op-1"
        );
        assert_eq!(twin_get(1), "$iothub/twin/GET/?$rid=1");
        assert_eq!(
            twin_reported_patch(2),
            "$iothub/twin/PATCH/properties/reported/?$rid=2"
        );
        assert_eq!(telemetry("d1"), "devices/d1/messages/events/");
        assert_eq!(commands("d1"), "devices/d1/messages/devicebound/#");
    }

    #[test]
    fn extracts_request_ids() {
        assert_eq!(request_id("$iothub/twin/res/200/?$rid=7"), Some("7"));
        assert_eq!(
            request_id("$dps/registrations/GET/iotdps-get-operationstatus/?$rid=2&operationId=op"),
            Some("2")
        );
        assert_eq!(request_id("$iothub/twin/res/200/"), None);
    }

    #[test]
    fn extracts_response_status() {
        assert_eq!(response_status("$iothub/twin/res/200/?$rid=1"), Some(200));
        assert_eq!(response_status("$iothub/twin/res/204/?$rid=2"), Some(204));
        assert_eq!(response_status("$iothub/twin/res/abc/?$rid=2"), None);
        assert_eq!(response_status("devices/d1/messages/events/"), None);
    }

    #[test]
    fn filter_matching_covers_wildcards() {
        assert!(matches_filter("devices/d1/messages/devicebound/cmd", "devices/d1/messages/devicebound/#"));
        assert!(matches_filter("$dps/registrations/res/200/?$rid=1", "$dps/registrations/res/#"));
        assert!(matches_filter("a/b/c", "a/+/c"));
        assert!(!matches_filter("a/b/c", "a/+"));
        assert!(!matches_filter("a/b", "a/b/c"));
        assert!(matches_filter("anything/at/all", "#"));
    }
}
