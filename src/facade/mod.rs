//! Query facade over the remote sensor service.
//!
//! [`SensorApi`] turns domain questions ("sum of this day", "busiest month") into
//! one HTTP query each, validates the response and hands the aggregate to a
//! callback. Operations covering the current period also subscribe to the
//! datastream's push topic and call the callback again on every new observation.

pub mod aggregate;
pub mod model;

pub use model::{
    things_from_value, Datastream, Observation, QueryOptions, Select, SelectValue, Selects,
    SensorQuery, Thing, TimeSetting, TotalQuery, UnitOfMeasurement,
};

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use chrono::{Datelike, Days, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::fill::SparseSeries;
use crate::subscription::{handler, Handler, HandlerError, SubscriptionRegistry};
use crate::transport::{FetchError, HttpFetch, PushTransport, SubscribeOptions};

use aggregate::{
    bucket_dates, bucket_observations, bucket_single_values, first_datastream, first_date,
    has_observations, label_for, sum_observations,
};

/// Instant format of query bounds.
const QUERY_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Key format of the sparse series handed out by dataset operations.
pub const SERIES_KEY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Errors surfaced to an operation's error callback
#[derive(Debug, Clone, PartialEq)]
pub enum ApiError {
    Fetch {
        operation: &'static str,
        source: FetchError,
    },
    Malformed {
        operation: &'static str,
        detail: String,
    },
    Payload {
        operation: &'static str,
        detail: String,
    },
}

impl ApiError {
    pub fn operation(&self) -> &'static str {
        match self {
            ApiError::Fetch { operation, .. }
            | ApiError::Malformed { operation, .. }
            | ApiError::Payload { operation, .. } => operation,
        }
    }

    fn malformed(operation: &'static str, detail: impl Into<String>) -> Self {
        ApiError::Malformed {
            operation,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Fetch { operation, source } => write!(f, "{}: {}", operation, source),
            ApiError::Malformed { operation, detail } => {
                write!(f, "{}: malformed response: {}", operation, detail)
            }
            ApiError::Payload { operation, detail } => {
                write!(f, "{}: malformed push payload: {}", operation, detail)
            }
        }
    }
}

impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ApiError::Fetch { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Error callback shared by an operation and its push handler.
pub type ErrorFn = Rc<dyn Fn(ApiError)>;

/// Per-label sums of one day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DaySum {
    pub day: NaiveDate,
    pub sums: BTreeMap<String, f64>,
}

/// Per-label first reading of one day with its unit, e.g. `"42 km/h"`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DaySingle {
    pub day: NaiveDate,
    pub values: BTreeMap<String, String>,
}

/// Sum of everything recorded so far and the day recording started
/// (`YYYY-MM-DD`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunningTotal {
    pub first_date: String,
    pub sum: f64,
}

/// Per-label sums of one year.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct YearSum {
    pub year: i32,
    pub sums: BTreeMap<String, f64>,
}

/// Per-label peak of a year and the period it happened in.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HighestWorkload {
    pub dates: BTreeMap<String, String>,
    pub values: BTreeMap<String, f64>,
}

/// Label -> sparse series, one entry per datastream.
pub type LabeledSeries = BTreeMap<String, SparseSeries>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadResult {
    pub title: String,
    pub data: LabeledSeries,
}

/// Client of one sensor service. Cloning shares the transports and the
/// subscription table.
#[derive(Clone)]
pub struct SensorApi {
    http: Rc<dyn HttpFetch>,
    push: Rc<dyn PushTransport>,
    registry: SubscriptionRegistry,
    api_version: String,
    base_url: String,
    today: Option<NaiveDate>,
}

impl SensorApi {
    pub fn new(
        http_host: &str,
        api_version: &str,
        http: Rc<dyn HttpFetch>,
        push: Rc<dyn PushTransport>,
    ) -> Self {
        Self {
            http,
            push,
            registry: SubscriptionRegistry::new(),
            api_version: api_version.to_string(),
            base_url: format!("{}/{}", http_host.trim_end_matches('/'), api_version),
            today: None,
        }
    }

    /// Pin "today", which decides whether day and dataset queries go live.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    /// Handler table fed by the push transport.
    pub fn registry(&self) -> SubscriptionRegistry {
        self.registry.clone()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Utc::now().date_naive())
    }

    /// Run one query and decode the response into things.
    pub fn fetch_once(
        &self,
        operation: &'static str,
        url: &str,
        on_data: impl FnOnce(Vec<Thing>) + 'static,
        on_error: ErrorFn,
    ) {
        debug!(operation, url, "query");
        self.http.get(
            url,
            Box::new(move |response| {
                let value = match response {
                    Ok(value) => value,
                    Err(source) => {
                        warn!(operation, error = %source, "query failed");
                        return on_error(ApiError::Fetch { operation, source });
                    }
                };
                match things_from_value(&value) {
                    Ok(things) => on_data(things),
                    Err(detail) => on_error(ApiError::malformed(operation, detail)),
                }
            }),
        );
    }

    /// Register `on_message` for `topic` and subscribe the transport.
    pub fn subscribe(&self, topic: &str, options: SubscribeOptions, on_message: Handler) {
        self.registry.subscribe(topic, on_message);
        self.push.subscribe(topic, options);
    }

    /// Drop every handler and tear down their transport subscriptions. Returns the
    /// topics that were active.
    pub fn unsubscribe_everything(&self) -> Vec<String> {
        let topics = self.registry.unsubscribe_all();
        for topic in &topics {
            self.push.unsubscribe(topic);
        }
        debug!(topics = topics.len(), "unsubscribed everything");
        topics
    }

    pub fn update_title(
        &self,
        thing_id: u64,
        on_update: impl FnOnce(String) + 'static,
        on_error: ErrorFn,
    ) {
        const OP: &str = "update_title";
        let errors = Rc::clone(&on_error);
        self.fetch_once(
            OP,
            &self.thing_url(thing_id),
            move |things| match things.into_iter().next().and_then(|thing| thing.name) {
                Some(name) => on_update(name),
                None => errors(ApiError::malformed(OP, "response has no Thing with a name")),
            },
            on_error,
        );
    }

    pub fn update_description(
        &self,
        thing_id: u64,
        on_update: impl FnOnce(String) + 'static,
        on_error: ErrorFn,
    ) {
        const OP: &str = "update_description";
        let errors = Rc::clone(&on_error);
        self.fetch_once(
            OP,
            &self.thing_url(thing_id),
            move |things| match things.into_iter().next().and_then(|thing| thing.description) {
                Some(description) => on_update(description),
                None => errors(ApiError::malformed(
                    OP,
                    "response has no Thing with a description",
                )),
            },
            on_error,
        );
    }

    pub fn update_property(
        &self,
        thing_id: u64,
        property: &str,
        on_update: impl FnOnce(Value) + 'static,
        on_error: ErrorFn,
    ) {
        const OP: &str = "update_property";
        let errors = Rc::clone(&on_error);
        let property = property.to_string();
        self.fetch_once(
            OP,
            &self.thing_url(thing_id),
            move |things| {
                let value = things
                    .into_iter()
                    .next()
                    .and_then(|thing| thing.properties)
                    .and_then(|mut properties| properties.remove(&property));
                match value {
                    Some(value) => on_update(value),
                    None => errors(ApiError::malformed(
                        OP,
                        format!("Thing has no property {}", property),
                    )),
                }
            },
            on_error,
        );
    }

    /// Per-label sums of `day`. When `day` is today the first datastream is
    /// followed live and `on_update` fires again for every new observation.
    pub fn update_day(
        &self,
        query: &SensorQuery,
        day: NaiveDate,
        on_update: impl Fn(DaySum) + 'static,
        on_error: ErrorFn,
    ) {
        const OP: &str = "update_day";
        let url = self.observations_url(
            query,
            day_start(day),
            UpperBound::Exclusive(day_start(next_day(day))),
            "",
        );
        let live = day == self.today();
        let api = self.clone();
        let query = query.clone();
        let errors = Rc::clone(&on_error);

        self.fetch_once(
            OP,
            &url,
            move |things| {
                if !has_observations(&things) {
                    return errors(ApiError::malformed(OP, NO_OBSERVATIONS));
                }
                let sums = bucket_observations(&things, &query.selects, &query.options)
                    .unwrap_or_default();
                let state = Rc::new(RefCell::new(DaySum { day, sums }));
                let on_update = Rc::new(on_update);
                on_update(state.borrow().clone());

                if !live {
                    return;
                }
                let Some((topic, label)) = api.live_target(&things, &query) else {
                    return;
                };
                api.subscribe(
                    &topic,
                    SubscribeOptions::skip_retained(),
                    handler(move |payload, meta| {
                        // A retained message is already part of the queried sum.
                        if meta.retain {
                            return Ok(());
                        }
                        let Some(result) = payload.get("result").and_then(Value::as_f64) else {
                            errors(ApiError::Payload {
                                operation: OP,
                                detail: format!("no result in {}", payload),
                            });
                            return Err(HandlerError::new("payload without result"));
                        };
                        *state.borrow_mut().sums.entry(label.clone()).or_insert(0.0) += result;
                        let snapshot = state.borrow().clone();
                        on_update(snapshot);
                        Ok(())
                    }),
                );
            },
            on_error,
        );
    }

    /// Per-label first reading of `day`. Never live.
    pub fn update_day_single(
        &self,
        query: &SensorQuery,
        day: NaiveDate,
        on_update: impl FnOnce(DaySingle) + 'static,
        on_error: ErrorFn,
    ) {
        const OP: &str = "update_day_single";
        let url = self.observations_url(
            query,
            day_start(day),
            UpperBound::Exclusive(day_start(next_day(day))),
            "",
        );
        let errors = Rc::clone(&on_error);
        let query = query.clone();

        self.fetch_once(
            OP,
            &url,
            move |things| match bucket_single_values(&things, &query.selects, &query.options) {
                Some(values) => on_update(DaySingle { day, values }),
                None => errors(ApiError::malformed(OP, NO_OBSERVATIONS)),
            },
            on_error,
        );
    }

    /// Per-label sums of `year`. The current year is summed up to last midnight.
    pub fn update_year(
        &self,
        query: &SensorQuery,
        year: i32,
        on_update: impl FnOnce(YearSum) + 'static,
        on_error: ErrorFn,
    ) {
        const OP: &str = "update_year";
        let Some((start, end)) = year_bounds(year) else {
            return on_error(ApiError::malformed(OP, format!("year {} out of range", year)));
        };
        let today = self.today();
        let end = if year == today.year() {
            day_start(today)
        } else {
            end
        };
        let url = self.observations_url(
            query,
            start,
            UpperBound::Exclusive(end),
            ";$orderby=phenomenonTime asc",
        );
        let errors = Rc::clone(&on_error);
        let query = query.clone();

        self.fetch_once(
            OP,
            &url,
            move |things| match bucket_observations(&things, &query.selects, &query.options) {
                Some(sums) => on_update(YearSum { year, sums }),
                None => errors(ApiError::malformed(OP, NO_OBSERVATIONS)),
            },
            on_error,
        );
    }

    /// Day of `year` with the highest single reading, dated `DD.MM.`.
    pub fn update_highest_workload_day(
        &self,
        query: &SensorQuery,
        year: i32,
        on_update: impl FnOnce(HighestWorkload) + 'static,
        on_error: ErrorFn,
    ) {
        self.top_reading(
            "update_highest_workload_day",
            query,
            year,
            |ts| ts.format("%d.%m.").to_string(),
            on_update,
            on_error,
        );
    }

    /// Week of `year` with the highest single reading, labeled `KW <iso week>`.
    pub fn update_highest_workload_week(
        &self,
        query: &SensorQuery,
        year: i32,
        on_update: impl FnOnce(HighestWorkload) + 'static,
        on_error: ErrorFn,
    ) {
        self.top_reading(
            "update_highest_workload_week",
            query,
            year,
            |ts| format!("KW {}", ts.iso_week().week()),
            on_update,
            on_error,
        );
    }

    fn top_reading(
        &self,
        operation: &'static str,
        query: &SensorQuery,
        year: i32,
        format: fn(NaiveDateTime) -> String,
        on_update: impl FnOnce(HighestWorkload) + 'static,
        on_error: ErrorFn,
    ) {
        let Some((start, end)) = year_bounds(year) else {
            return on_error(ApiError::malformed(
                operation,
                format!("year {} out of range", year),
            ));
        };
        let url = self.observations_url(
            query,
            start,
            UpperBound::Exclusive(end),
            ";$orderby=result desc;$top=1",
        );
        let errors = Rc::clone(&on_error);
        let query = query.clone();
        let not_after = now_iso();

        self.fetch_once(
            operation,
            &url,
            move |things| {
                let values = bucket_observations(&things, &query.selects, &query.options);
                let dates = bucket_dates(&things, &query.selects, &query.options, &not_after, format);
                match (values, dates) {
                    (Some(values), Some(dates)) => on_update(HighestWorkload { dates, values }),
                    _ => errors(ApiError::malformed(operation, NO_OBSERVATIONS)),
                }
            },
            on_error,
        );
    }

    /// Month of `year` whose readings add up to the highest sum, by English name.
    pub fn update_highest_workload_month(
        &self,
        query: &SensorQuery,
        year: i32,
        on_update: impl FnOnce(HighestWorkload) + 'static,
        on_error: ErrorFn,
    ) {
        const OP: &str = "update_highest_workload_month";
        let Some((start, end)) = year_bounds(year) else {
            return on_error(ApiError::malformed(OP, format!("year {} out of range", year)));
        };
        let url = self.observations_url(query, start, UpperBound::Exclusive(end), "");
        let errors = Rc::clone(&on_error);
        let query = query.clone();

        self.fetch_once(
            OP,
            &url,
            move |things| {
                let Some(peaks) = aggregate::highest_month(&things, &query.selects, &query.options)
                else {
                    return errors(ApiError::malformed(OP, NO_OBSERVATIONS));
                };
                let mut workload = HighestWorkload::default();
                for (label, peak) in peaks {
                    workload
                        .dates
                        .insert(label.clone(), peak.month_name().to_string());
                    workload.values.insert(label, peak.sum);
                }
                on_update(workload);
            },
            on_error,
        );
    }

    /// Sum of all weekly readings before this week's Monday plus every reading
    /// since, and the oldest phenomenon time of both. The recent datastream is
    /// followed live.
    pub fn update_total(
        &self,
        query: &TotalQuery,
        on_update: impl Fn(RunningTotal) + 'static,
        on_error: ErrorFn,
    ) {
        const OP: &str = "update_total";
        let monday = day_start(week_start(self.today()))
            .format(QUERY_TIME_FORMAT)
            .to_string();
        let weekly_url = self.expanded_url(
            query.thing_id,
            &query.weekly_filter,
            &format!("Observations($filter=phenomenonTime lt {})", monday),
        );
        let recent_url = self.expanded_url(
            query.thing_id,
            &query.recent_filter,
            &format!("Observations($filter=phenomenonTime ge {})", monday),
        );
        let api = self.clone();
        let errors = Rc::clone(&on_error);
        let not_after = now_iso();

        self.fetch_once(
            OP,
            &weekly_url,
            move |weekly| {
                let (Some(weekly_sum), Some(first)) =
                    (sum_observations(&weekly), first_date(&weekly, &not_after))
                else {
                    return errors(ApiError::malformed(OP, "weekly datastream has no observations"));
                };
                let live_api = api.clone();
                let recent_errors = Rc::clone(&errors);
                api.fetch_once(
                    OP,
                    &recent_url,
                    move |recent| {
                        let (Some(recent_sum), Some(first)) =
                            (sum_observations(&recent), first_date(&recent, &first))
                        else {
                            return recent_errors(ApiError::malformed(
                                OP,
                                "recent datastream has no observations",
                            ));
                        };
                        let state = Rc::new(RefCell::new(RunningTotal {
                            first_date: day_of(&first),
                            sum: weekly_sum + recent_sum,
                        }));
                        let on_update = Rc::new(on_update);
                        on_update(state.borrow().clone());

                        let Some(topic) = live_api.topic_of(&recent) else {
                            return;
                        };
                        live_api.subscribe(
                            &topic,
                            SubscribeOptions::skip_retained(),
                            handler(move |payload, meta| {
                                if meta.retain {
                                    return Ok(());
                                }
                                let Some(result) = payload.get("result").and_then(Value::as_f64)
                                else {
                                    recent_errors(ApiError::Payload {
                                        operation: OP,
                                        detail: format!("no result in {}", payload),
                                    });
                                    return Err(HandlerError::new("payload without result"));
                                };
                                state.borrow_mut().sum += result;
                                let snapshot = state.borrow().clone();
                                on_update(snapshot);
                                Ok(())
                            }),
                        );
                    },
                    errors,
                );
            },
            on_error,
        );
    }

    /// Day of the oldest reading ever recorded by the matching datastreams,
    /// `YYYY-MM-DD`.
    pub fn get_first_date_ever(
        &self,
        query: &SensorQuery,
        on_success: impl FnOnce(String) + 'static,
        on_error: ErrorFn,
    ) {
        const OP: &str = "get_first_date_ever";
        let url = self.expanded_url(query.thing_id, &query.filter, "Observations");
        let errors = Rc::clone(&on_error);
        let not_after = now_iso();

        self.fetch_once(
            OP,
            &url,
            move |things| match first_date(&things, &not_after) {
                Some(first) => on_success(day_of(&first)),
                None => errors(ApiError::malformed(OP, NO_OBSERVATIONS)),
            },
            on_error,
        );
    }

    /// Per-label sparse series for `setting`. Goes live when `setting.until` is
    /// today or later.
    pub fn update_dataset(
        &self,
        query: &SensorQuery,
        setting: &TimeSetting,
        on_update: impl Fn(LabeledSeries) + 'static,
        on_error: ErrorFn,
    ) {
        self.dataset(query, setting, true, on_update, on_error);
    }

    fn dataset(
        &self,
        query: &SensorQuery,
        setting: &TimeSetting,
        allow_live: bool,
        on_update: impl Fn(LabeledSeries) + 'static,
        on_error: ErrorFn,
    ) {
        const OP: &str = "update_dataset";
        let url = self.observations_url(
            query,
            day_start(setting.from),
            UpperBound::Inclusive(day_start(next_day(setting.until))),
            ";$orderby=phenomenonTime asc",
        );
        let live = allow_live && setting.until >= self.today();
        let suffix = date_label(setting.from, setting.until);
        let api = self.clone();
        let query = query.clone();
        let errors = Rc::clone(&on_error);

        self.fetch_once(
            OP,
            &url,
            move |things| {
                if !has_observations(&things) {
                    return errors(ApiError::malformed(OP, NO_OBSERVATIONS));
                }
                let mut series = LabeledSeries::new();
                for ds in things[0].datastreams.iter().flatten() {
                    let label = format!("{} {}", label_for(ds, &query.selects, &query.options), suffix);
                    let readings = series.entry(label).or_default();
                    for obs in ds.observations() {
                        let (Some(time), Some(result)) = (obs.phenomenon_time.as_deref(), obs.result)
                        else {
                            continue;
                        };
                        if let Some(key) = series_key(time) {
                            readings.insert(key, Some(result));
                        }
                    }
                }
                let state = Rc::new(RefCell::new(series));
                let on_update = Rc::new(on_update);
                on_update(state.borrow().clone());

                if !live {
                    return;
                }
                let Some((topic, label)) = api.live_target(&things, &query) else {
                    return;
                };
                let label = format!("{} {}", label, suffix);
                api.subscribe(
                    &topic,
                    SubscribeOptions::skip_retained(),
                    handler(move |payload, meta| {
                        if meta.retain {
                            return Ok(());
                        }
                        let reading = payload.get("result").and_then(Value::as_f64).zip(
                            payload
                                .get("phenomenonTime")
                                .and_then(Value::as_str)
                                .and_then(series_key),
                        );
                        let Some((result, key)) = reading else {
                            errors(ApiError::Payload {
                                operation: OP,
                                detail: format!("no result or phenomenonTime in {}", payload),
                            });
                            return Err(HandlerError::new("payload without result"));
                        };
                        state
                            .borrow_mut()
                            .entry(label.clone())
                            .or_default()
                            .insert(key, Some(result));
                        let snapshot = state.borrow().clone();
                        on_update(snapshot);
                        Ok(())
                    }),
                );
            },
            on_error,
        );
    }

    /// Time of the latest result of the first matching datastream, as
    /// `YYYY-MM-DD HH:MM:SS` in UTC.
    pub fn subscribe_last_update(
        &self,
        query: &SensorQuery,
        on_update: impl FnOnce(String) + 'static,
        on_error: ErrorFn,
    ) {
        const OP: &str = "subscribe_last_update";
        let url = self.datastreams_url(query);
        let errors = Rc::clone(&on_error);

        self.fetch_once(
            OP,
            &url,
            move |things| {
                let result_time = first_datastream(&things).and_then(|ds| ds.result_time.clone());
                let Some(result_time) = result_time else {
                    return errors(ApiError::malformed(OP, "no Datastream with a resultTime"));
                };
                // A result time interval ends at its latest result.
                let latest = result_time.rsplit('/').next().unwrap_or(&result_time);
                match series_key(latest) {
                    Some(key) => on_update(key),
                    None => errors(ApiError::malformed(
                        OP,
                        format!("unparseable resultTime {}", result_time),
                    )),
                }
            },
            on_error,
        );
    }

    pub fn get_unit_of_measurement(
        &self,
        query: &SensorQuery,
        on_success: impl FnOnce(UnitOfMeasurement) + 'static,
        on_error: ErrorFn,
    ) {
        const OP: &str = "get_unit_of_measurement";
        let url = self.datastreams_url(query);
        let errors = Rc::clone(&on_error);

        self.fetch_once(
            OP,
            &url,
            move |things| {
                let unit = aggregate::has_units(&things)
                    .then(|| first_datastream(&things).and_then(|ds| ds.unit_of_measurement.clone()))
                    .flatten();
                match unit {
                    Some(unit) => on_success(unit),
                    None => errors(ApiError::malformed(
                        OP,
                        "no Datastream with a unitOfMeasurement",
                    )),
                }
            },
            on_error,
        );
    }

    /// Title plus dataset in one go, never subscribing.
    pub fn download_data(
        &self,
        query: &SensorQuery,
        setting: &TimeSetting,
        on_success: impl FnOnce(DownloadResult) + 'static,
        on_error: ErrorFn,
    ) {
        let api = self.clone();
        let query = query.clone();
        let setting = setting.clone();
        let errors = Rc::clone(&on_error);
        let on_success = Rc::new(RefCell::new(Some(on_success)));

        self.update_title(
            query.thing_id,
            move |title| {
                api.dataset(
                    &query,
                    &setting,
                    false,
                    move |data| {
                        if let Some(on_success) = on_success.borrow_mut().take() {
                            on_success(DownloadResult {
                                title: title.clone(),
                                data,
                            });
                        }
                    },
                    errors,
                );
            },
            on_error,
        );
    }

    fn thing_url(&self, thing_id: u64) -> String {
        format!("{}/Things({})", self.base_url, thing_id)
    }

    fn datastreams_url(&self, query: &SensorQuery) -> String {
        let expand = if query.filter.is_empty() {
            "Datastreams".to_string()
        } else {
            format!("Datastreams($filter={})", query.filter)
        };
        format!(
            "{}?$expand={}",
            self.thing_url(query.thing_id),
            urlencoding::encode(&expand)
        )
    }

    fn observations_url(
        &self,
        query: &SensorQuery,
        start: NaiveDateTime,
        end: UpperBound,
        extra: &str,
    ) -> String {
        let (op, end) = match end {
            UpperBound::Exclusive(end) => ("lt", end),
            UpperBound::Inclusive(end) => ("le", end),
        };
        let observations = format!(
            "Observations($filter=phenomenonTime ge {} and phenomenonTime {} {}{})",
            start.format(QUERY_TIME_FORMAT),
            op,
            end.format(QUERY_TIME_FORMAT),
            extra
        );
        self.expanded_url(query.thing_id, &query.filter, &observations)
    }

    /// Thing with its datastreams, each expanded by `observations`.
    fn expanded_url(&self, thing_id: u64, filter: &str, observations: &str) -> String {
        let expand = if filter.is_empty() {
            format!("Datastreams($expand={})", observations)
        } else {
            format!("Datastreams($filter={};$expand={})", filter, observations)
        };
        format!(
            "{}?$expand={}",
            self.thing_url(thing_id),
            urlencoding::encode(&expand)
        )
    }

    fn topic_of(&self, things: &[Thing]) -> Option<String> {
        let id = first_datastream(things)?.id_string()?;
        Some(format!("{}/Datastreams({})/Observations", self.api_version, id))
    }

    /// Push topic and label of the first datastream.
    fn live_target(&self, things: &[Thing], query: &SensorQuery) -> Option<(String, String)> {
        let ds = first_datastream(things)?;
        Some((self.topic_of(things)?, label_for(ds, &query.selects, &query.options)))
    }
}

const NO_OBSERVATIONS: &str = "no Datastream with observations";

enum UpperBound {
    Exclusive(NaiveDateTime),
    Inclusive(NaiveDateTime),
}

fn day_start(day: NaiveDate) -> NaiveDateTime {
    day.and_time(chrono::NaiveTime::MIN)
}

fn next_day(day: NaiveDate) -> NaiveDate {
    day.checked_add_days(Days::new(1)).unwrap_or(day)
}

fn week_start(day: NaiveDate) -> NaiveDate {
    day.checked_sub_days(Days::new(u64::from(day.weekday().num_days_from_monday())))
        .unwrap_or(day)
}

fn year_bounds(year: i32) -> Option<(NaiveDateTime, NaiveDateTime)> {
    let start = NaiveDate::from_ymd_opt(year, 1, 1)?;
    let end = NaiveDate::from_ymd_opt(year.checked_add(1)?, 1, 1)?;
    Some((day_start(start), day_start(end)))
}

fn now_iso() -> String {
    Utc::now().format(QUERY_TIME_FORMAT).to_string()
}

/// `YYYY-MM-DD` of an ISO instant; unparseable input is passed through.
fn day_of(instant: &str) -> String {
    model::parse_instant(aggregate::parse_phenomenon_time(instant))
        .map(|ts| ts.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| instant.to_string())
}

/// `DD.MM.YYYY`, or `DD.MM.YYYY bis DD.MM.YYYY` for a range.
fn date_label(from: NaiveDate, until: NaiveDate) -> String {
    let from_label = from.format("%d.%m.%Y").to_string();
    if from == until {
        from_label
    } else {
        format!("{} bis {}", from_label, until.format("%d.%m.%Y"))
    }
}

/// Series key of a phenomenon time.
fn series_key(phenomenon_time: &str) -> Option<String> {
    model::parse_instant(aggregate::parse_phenomenon_time(phenomenon_time))
        .map(|ts| ts.format(SERIES_KEY_FORMAT).to_string())
}
