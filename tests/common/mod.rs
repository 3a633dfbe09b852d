#![allow(dead_code)]

use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateWaiting, ContainerStatus, Pod, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use store_operator::crd::{Engine, Store, StoreSpec, StoreStatus};

pub fn make_store(name: &str, engine: Engine, owner: &str) -> Store {
    Store::new(
        name,
        StoreSpec {
            engine,
            owner: owner.to_string(),
            domain_suffix: Some("local.urumi".to_string()),
        },
    )
}

pub fn make_store_with_status(
    name: &str,
    engine: Engine,
    owner: &str,
    status: StoreStatus,
) -> Store {
    let mut store = make_store(name, engine, owner);
    store.status = Some(status);
    store
}

pub fn make_pod(name: &str, phase: &str, ready: bool, waiting_reason: Option<&str>) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: None,
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            container_statuses: Some(vec![ContainerStatus {
                name: "main".to_string(),
                ready,
                restart_count: 0,
                image: "img:1".to_string(),
                image_id: String::new(),
                state: waiting_reason.map(|reason| ContainerState {
                    waiting: Some(ContainerStateWaiting {
                        reason: Some(reason.to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}
