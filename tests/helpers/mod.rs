#![allow(dead_code)] // Test helpers appear unused when compiled independently

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use chrono::NaiveDate;
use serde_json::{json, Value};

use sensorchart::transport::{ChannelPush, FetchError, HttpFetch, ResponseFn};
use sensorchart::{SensorApi, SubscriptionRegistry};

pub const HOST: &str = "https://sensors.example.org/FROST-Server";
pub const VERSION: &str = "v1.1";
pub const TOPIC: &str = "v1.1/Datastreams(31)/Observations";

/// In-memory sensor service. Routes match when their needle occurs in the
/// percent-decoded URL; the most recently added route wins.
#[derive(Default)]
pub struct MockHttp {
    routes: RefCell<Vec<(String, Result<Value, FetchError>)>>,
    deferred: Cell<bool>,
    pending: RefCell<VecDeque<(String, ResponseFn)>>,
    requests: RefCell<Vec<String>>,
}

impl MockHttp {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn route(&self, needle: &str, response: Value) {
        self.routes
            .borrow_mut()
            .push((needle.to_string(), Ok(response)));
    }

    pub fn fail(&self, needle: &str, error: FetchError) {
        self.routes
            .borrow_mut()
            .push((needle.to_string(), Err(error)));
    }

    /// Hold responses until [`flush`](Self::flush) is called.
    pub fn defer(&self) {
        self.deferred.set(true);
    }

    /// Answer every held request, including ones issued while flushing.
    pub fn flush(&self) -> usize {
        let mut answered = 0;
        loop {
            let next = self.pending.borrow_mut().pop_front();
            let Some((url, on_response)) = next else {
                break;
            };
            on_response(self.respond(&url));
            answered += 1;
        }
        answered
    }

    pub fn pending(&self) -> usize {
        self.pending.borrow().len()
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.borrow().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.borrow().len()
    }

    fn respond(&self, url: &str) -> Result<Value, FetchError> {
        self.routes
            .borrow()
            .iter()
            .rev()
            .find(|(needle, _)| url.contains(needle.as_str()))
            .map(|(_, response)| response.clone())
            .unwrap_or_else(|| Err(FetchError::Network(format!("no route for {}", url))))
    }
}

impl HttpFetch for MockHttp {
    fn get(&self, url: &str, on_response: ResponseFn) {
        let decoded = urlencoding::decode(url)
            .map(|url| url.into_owned())
            .unwrap_or_else(|_| url.to_string());
        self.requests.borrow_mut().push(decoded.clone());
        if self.deferred.get() {
            self.pending.borrow_mut().push_back((decoded, on_response));
            return;
        }
        let response = self.respond(&decoded);
        on_response(response);
    }
}

pub fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2021, 6, 1).unwrap()
}

/// Api over a mock service and a recording push transport, with "today" pinned.
pub fn mock_api() -> (SensorApi, Rc<MockHttp>, Rc<ChannelPush>, SubscriptionRegistry) {
    let http = MockHttp::new();
    let push = Rc::new(ChannelPush::new());
    let api = SensorApi::new(HOST, VERSION, http.clone(), push.clone()).with_today(today());
    let registry = api.registry();
    (api, http, push, registry)
}

/// One thing with one datastream (id 31) carrying `results`, 15 minutes apart
/// from 08:00 on `day`.
pub fn thing_with_results(day: NaiveDate, results: &[f64]) -> Value {
    let observations: Vec<Value> = results
        .iter()
        .enumerate()
        .map(|(i, result)| {
            let start = day.and_hms_opt(8, 0, 0).unwrap() + chrono::TimeDelta::minutes(15 * i as i64);
            let end = start + chrono::TimeDelta::minutes(15);
            json!({
                "phenomenonTime": format!(
                    "{}/{}",
                    start.format("%Y-%m-%dT%H:%M:%SZ"),
                    end.format("%Y-%m-%dT%H:%M:%SZ")
                ),
                "result": result,
            })
        })
        .collect();

    json!({
        "@iot.id": 7,
        "name": "Zaehlstelle Nord",
        "description": "Radweg an der Friedensbruecke",
        "properties": { "city": "Ulm", "lanes": 2 },
        "Datastreams": [{
            "@iot.id": 31,
            "properties": { "vehicle": "Rad" },
            "unitOfMeasurement": { "name": "Anzahl", "symbol": "Stk", "definition": "" },
            "resultTime": "2021-06-01T00:00:00Z/2021-06-01T10:15:00Z",
            "Observations": observations,
        }],
    })
}

/// Push payload of a new observation.
pub fn observation(time: &str, result: f64) -> Value {
    json!({ "phenomenonTime": time, "result": result })
}

pub fn recorder<T: 'static>() -> (Rc<RefCell<Vec<T>>>, impl Fn(T) + Clone + 'static) {
    let log = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&log);
    (log, move |value: T| sink.borrow_mut().push(value))
}
