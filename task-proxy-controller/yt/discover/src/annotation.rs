use serde_json::Value;
use task_proxy_controller_core::Protocol;

/// One `(task, port index) -> (service, protocol)` mapping declared by an
/// operation's `task_proxy` annotation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskServiceInfo {
    pub task: String,
    pub service: String,
    pub protocol: Protocol,
    pub port_index: usize,
}

/// Parses a `task_proxy` operation annotation.
///
/// `None` means the annotation is unusable: not a map, `enabled` missing or
/// not a bool, or explicitly disabled. An enabled annotation without
/// `tasks_info` parses to an empty list, which is present but unconfigured
/// and not the same as disabled. Service entries with a missing or mistyped
/// field are dropped silently and their siblings survive; annotations are
/// user-supplied.
pub fn parse_task_proxy_annotation(annotation: &Value) -> Option<Vec<TaskServiceInfo>> {
    let annotation = annotation.as_object()?;
    if !annotation.get("enabled")?.as_bool()? {
        return None;
    }

    let mut infos = Vec::new();
    let Some(tasks_info) = annotation.get("tasks_info").and_then(Value::as_object) else {
        return Some(infos);
    };

    for (task, services) in tasks_info {
        let Some(services) = services.as_object() else {
            continue;
        };
        for (service, info) in services {
            let Some(info) = info.as_object() else {
                continue;
            };
            let Some(protocol) = info.get("protocol").and_then(Value::as_str) else {
                continue;
            };
            let Ok(protocol) = protocol.parse::<Protocol>() else {
                continue;
            };
            let Some(port_index) = info.get("port_index").and_then(Value::as_u64) else {
                continue;
            };
            infos.push(TaskServiceInfo {
                task: task.clone(),
                service: service.clone(),
                protocol,
                port_index: port_index as usize,
            });
        }
    }
    Some(infos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn serialize(infos: &[TaskServiceInfo]) -> Value {
        let mut tasks_info = serde_json::Map::new();
        for info in infos {
            tasks_info
                .entry(info.task.clone())
                .or_insert_with(|| json!({}))
                .as_object_mut()
                .unwrap()
                .insert(
                    info.service.clone(),
                    json!({
                        "protocol": info.protocol.as_str(),
                        "port_index": info.port_index,
                    }),
                );
        }
        json!({"enabled": true, "tasks_info": tasks_info})
    }

    #[test]
    fn parses_grpc_service() {
        let annotation = json!({
            "enabled": true,
            "tasks_info": {
                "example_grpc_server": {
                    "server": {"protocol": "grpc", "port_index": 0}
                }
            }
        });
        assert_eq!(
            parse_task_proxy_annotation(&annotation).unwrap(),
            vec![TaskServiceInfo {
                task: "example_grpc_server".to_string(),
                service: "server".to_string(),
                protocol: Protocol::Grpc,
                port_index: 0,
            }]
        );
    }

    #[test]
    fn disabled_or_malformed_yields_none() {
        for annotation in [
            json!({"enabled": false, "tasks_info": {"t": {"s": {"protocol": "http", "port_index": 0}}}}),
            json!({"enabled": "yes"}),
            json!({"tasks_info": {}}),
            json!("task_proxy"),
            json!(null),
        ] {
            assert_eq!(parse_task_proxy_annotation(&annotation), None, "{annotation}");
        }
    }

    #[test]
    fn enabled_without_tasks_info_is_empty_not_none() {
        for annotation in [
            json!({"enabled": true}),
            json!({"enabled": true, "tasks_info": ["not", "a", "map"]}),
        ] {
            assert_eq!(parse_task_proxy_annotation(&annotation), Some(vec![]), "{annotation}");
        }
    }

    #[test]
    fn bad_entries_are_dropped_and_siblings_survive() {
        let annotation = json!({
            "enabled": true,
            "tasks_info": {
                "srv": {
                    "api": {"protocol": "grpc", "port_index": 0},
                    "no_protocol": {"port_index": 1},
                    "bad_protocol": {"protocol": "tcp", "port_index": 2},
                    "typed_protocol": {"protocol": 80, "port_index": 3},
                    "no_index": {"protocol": "http"},
                    "float_index": {"protocol": "http", "port_index": 1.5},
                    "negative_index": {"protocol": "http", "port_index": -1},
                    "ok": {"protocol": "http", "port_index": 4}
                },
                "not_a_map": 42
            }
        });
        let mut infos = parse_task_proxy_annotation(&annotation).unwrap();
        infos.sort_by_key(|i| i.port_index);
        assert_eq!(
            infos,
            vec![
                TaskServiceInfo {
                    task: "srv".to_string(),
                    service: "api".to_string(),
                    protocol: Protocol::Grpc,
                    port_index: 0,
                },
                TaskServiceInfo {
                    task: "srv".to_string(),
                    service: "ok".to_string(),
                    protocol: Protocol::Http,
                    port_index: 4,
                },
            ]
        );
    }

    #[test]
    fn round_trips_legal_annotations() {
        let mut infos = vec![
            TaskServiceInfo {
                task: "srv".to_string(),
                service: "api".to_string(),
                protocol: Protocol::Grpc,
                port_index: 0,
            },
            TaskServiceInfo {
                task: "srv".to_string(),
                service: "metrics".to_string(),
                protocol: Protocol::Http,
                port_index: 1,
            },
            TaskServiceInfo {
                task: "web".to_string(),
                service: "ui".to_string(),
                protocol: Protocol::Http,
                port_index: 0,
            },
        ];
        let mut parsed = parse_task_proxy_annotation(&serialize(&infos)).unwrap();
        infos.sort_by_key(|i| (i.task.clone(), i.service.clone()));
        parsed.sort_by_key(|i| (i.task.clone(), i.service.clone()));
        assert_eq!(parsed, infos);
    }
}
