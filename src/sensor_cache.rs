//! Cached access to [`SensorApi`].
//!
//! Every operation goes through one [`CacheCoordinator`] under a canonical key, so
//! concurrent callers asking the same question share one query. Live operations
//! keep completing their key after it resolved; the latest caller's callback is
//! the key's observer and sees those updates.

use std::fmt::Debug;
use std::rc::Rc;

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::{
    CacheCoordinator, CacheRequest, Completion, Dispatch, FailurePolicy, Observe, ObserverFn,
};
use crate::facade::{
    ApiError, DaySingle, DaySum, DownloadResult, ErrorFn, HighestWorkload, LabeledSeries,
    RunningTotal, SensorApi, SensorQuery, TimeSetting, TotalQuery, UnitOfMeasurement, YearSum,
};

/// Value stored per cache key.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    Text(String),
    Property(Value),
    Day(DaySum),
    DaySingle(DaySingle),
    Year(YearSum),
    Total(RunningTotal),
    Workload(HighestWorkload),
    Dataset(LabeledSeries),
    Unit(UnitOfMeasurement),
}

impl CachedValue {
    fn as_text(&self) -> Option<String> {
        match self {
            CachedValue::Text(text) => Some(text.clone()),
            _ => None,
        }
    }

    fn as_property(&self) -> Option<Value> {
        match self {
            CachedValue::Property(value) => Some(value.clone()),
            _ => None,
        }
    }

    fn as_day(&self) -> Option<DaySum> {
        match self {
            CachedValue::Day(day) => Some(day.clone()),
            _ => None,
        }
    }

    fn as_day_single(&self) -> Option<DaySingle> {
        match self {
            CachedValue::DaySingle(single) => Some(single.clone()),
            _ => None,
        }
    }

    fn as_total(&self) -> Option<RunningTotal> {
        match self {
            CachedValue::Total(total) => Some(total.clone()),
            _ => None,
        }
    }

    fn as_year(&self) -> Option<YearSum> {
        match self {
            CachedValue::Year(year) => Some(year.clone()),
            _ => None,
        }
    }

    fn as_workload(&self) -> Option<HighestWorkload> {
        match self {
            CachedValue::Workload(workload) => Some(workload.clone()),
            _ => None,
        }
    }

    fn as_dataset(&self) -> Option<LabeledSeries> {
        match self {
            CachedValue::Dataset(series) => Some(series.clone()),
            _ => None,
        }
    }

    fn as_unit(&self) -> Option<UnitOfMeasurement> {
        match self {
            CachedValue::Unit(unit) => Some(unit.clone()),
            _ => None,
        }
    }
}

/// Optional lifecycle callbacks of one cached call.
#[derive(Default)]
pub struct Hooks {
    on_start: Option<Box<dyn FnOnce()>>,
    on_complete: Option<Box<dyn FnOnce()>>,
    on_error: Option<ErrorFn>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_start(mut self, on_start: impl FnOnce() + 'static) -> Self {
        self.on_start = Some(Box::new(on_start));
        self
    }

    pub fn on_complete(mut self, on_complete: impl FnOnce() + 'static) -> Self {
        self.on_complete = Some(Box::new(on_complete));
        self
    }

    pub fn on_error(mut self, on_error: impl Fn(ApiError) + 'static) -> Self {
        self.on_error = Some(Rc::new(on_error));
        self
    }
}

/// Canonical key: the JSON array `[operation, subject, params]`. The subject is the
/// whole query, options included, and JSON escaping keeps separators inside
/// filters or params from running into neighbouring fields.
fn cache_key(operation: &str, subject: &(impl Serialize + Debug), params: &[&str]) -> String {
    serde_json::to_string(&(operation, subject, params))
        .unwrap_or_else(|_| format!("{:?}", (operation, subject, params)))
}

fn thing_key(operation: &str, thing_id: u64, params: &[&str]) -> String {
    cache_key(operation, &thing_id, params)
}

/// Error callback handed to the facade on behalf of a fetch.
///
/// While the key is in flight the failure goes through the coordinator, which
/// informs every parked caller. Later errors (push payloads, stale fetches) go to
/// the caller that started the fetch.
fn route_errors(completion: Completion<CachedValue, ApiError>, initiator: Option<ErrorFn>) -> ErrorFn {
    Rc::new(move |error: ApiError| {
        if completion.fail(error.clone()) {
            return;
        }
        match &initiator {
            Some(on_error) => on_error(error),
            None => warn!(key = %completion.key(), error = %error, "unhandled sensor error"),
        }
    })
}

fn log_errors() -> ErrorFn {
    Rc::new(|error: ApiError| warn!(error = %error, "unhandled sensor error"))
}

/// Sensor queries behind a single-flight cache. Cloning shares the cache.
#[derive(Clone)]
pub struct SensorCache {
    api: SensorApi,
    cache: CacheCoordinator<CachedValue, ApiError>,
}

impl SensorCache {
    pub fn new(api: SensorApi, policy: FailurePolicy) -> Self {
        Self {
            api,
            cache: CacheCoordinator::with_policy(policy),
        }
    }

    pub fn api(&self) -> &SensorApi {
        &self.api
    }

    pub fn coordinator(&self) -> &CacheCoordinator<CachedValue, ApiError> {
        &self.cache
    }

    /// Issue one cached request. With `observe`, `on_update` also becomes the key's
    /// observer; otherwise the registered observer is left alone.
    fn cached<R: 'static>(
        &self,
        key: String,
        observe: bool,
        hooks: Hooks,
        extract: fn(&CachedValue) -> Option<R>,
        on_update: Rc<dyn Fn(R)>,
        fetch: impl FnOnce(&SensorApi, Completion<CachedValue, ApiError>, ErrorFn) + 'static,
    ) -> Dispatch {
        let Hooks {
            on_start,
            on_complete,
            on_error,
        } = hooks;
        let api = self.api.clone();
        let initiator = on_error.clone();

        let ready = Rc::clone(&on_update);
        let mut request = CacheRequest::new(key, move |completion: Completion<CachedValue, ApiError>| {
            let errors = route_errors(completion.clone(), initiator);
            fetch(&api, completion, errors);
        })
        .on_ready(move |value| {
            if let Some(value) = extract(value) {
                ready(value);
            }
        });

        if observe {
            request = request.observe(Observe::notify(move |value| {
                if let Some(value) = extract(value) {
                    on_update(value);
                }
            }));
        }
        if let Some(on_start) = on_start {
            request = request.on_start(on_start);
        }
        if let Some(on_complete) = on_complete {
            request = request.on_complete(on_complete);
        }
        if let Some(on_error) = on_error {
            request = request.on_error(move |error: &ApiError| on_error(error.clone()));
        }
        self.cache.request(request)
    }

    pub fn update_title(
        &self,
        thing_id: u64,
        on_update: impl Fn(String) + 'static,
        hooks: Hooks,
    ) -> Dispatch {
        self.cached(
            thing_key("update_title", thing_id, &[]),
            true,
            hooks,
            CachedValue::as_text,
            Rc::new(on_update),
            move |api, completion, errors| {
                api.update_title(
                    thing_id,
                    move |title| {
                        completion.complete(CachedValue::Text(title));
                    },
                    errors,
                )
            },
        )
    }

    pub fn update_description(
        &self,
        thing_id: u64,
        on_update: impl Fn(String) + 'static,
        hooks: Hooks,
    ) -> Dispatch {
        self.cached(
            thing_key("update_description", thing_id, &[]),
            true,
            hooks,
            CachedValue::as_text,
            Rc::new(on_update),
            move |api, completion, errors| {
                api.update_description(
                    thing_id,
                    move |description| {
                        completion.complete(CachedValue::Text(description));
                    },
                    errors,
                )
            },
        )
    }

    pub fn update_property(
        &self,
        thing_id: u64,
        property: &str,
        on_update: impl Fn(Value) + 'static,
        hooks: Hooks,
    ) -> Dispatch {
        let name = property.to_string();
        self.cached(
            thing_key("update_property", thing_id, &[property]),
            true,
            hooks,
            CachedValue::as_property,
            Rc::new(on_update),
            move |api, completion, errors| {
                api.update_property(
                    thing_id,
                    &name,
                    move |value| {
                        completion.complete(CachedValue::Property(value));
                    },
                    errors,
                )
            },
        )
    }

    pub fn update_day(
        &self,
        query: &SensorQuery,
        day: NaiveDate,
        on_update: impl Fn(DaySum) + 'static,
        hooks: Hooks,
    ) -> Dispatch {
        let query = query.clone();
        self.cached(
            cache_key("update_day", &query, &[&day.to_string()]),
            true,
            hooks,
            CachedValue::as_day,
            Rc::new(on_update),
            move |api, completion, errors| {
                api.update_day(
                    &query,
                    day,
                    move |sum| {
                        completion.complete(CachedValue::Day(sum));
                    },
                    errors,
                )
            },
        )
    }

    pub fn update_day_single(
        &self,
        query: &SensorQuery,
        day: NaiveDate,
        on_update: impl Fn(DaySingle) + 'static,
        hooks: Hooks,
    ) -> Dispatch {
        let query = query.clone();
        self.cached(
            cache_key("update_day_single", &query, &[&day.to_string()]),
            true,
            hooks,
            CachedValue::as_day_single,
            Rc::new(on_update),
            move |api, completion, errors| {
                api.update_day_single(
                    &query,
                    day,
                    move |single| {
                        completion.complete(CachedValue::DaySingle(single));
                    },
                    errors,
                )
            },
        )
    }

    pub fn update_year(
        &self,
        query: &SensorQuery,
        year: i32,
        on_update: impl Fn(YearSum) + 'static,
        hooks: Hooks,
    ) -> Dispatch {
        let query = query.clone();
        self.cached(
            cache_key("update_year", &query, &[&year.to_string()]),
            true,
            hooks,
            CachedValue::as_year,
            Rc::new(on_update),
            move |api, completion, errors| {
                api.update_year(
                    &query,
                    year,
                    move |sum| {
                        completion.complete(CachedValue::Year(sum));
                    },
                    errors,
                )
            },
        )
    }

    pub fn update_highest_workload_day(
        &self,
        query: &SensorQuery,
        year: i32,
        on_update: impl Fn(HighestWorkload) + 'static,
        hooks: Hooks,
    ) -> Dispatch {
        let query = query.clone();
        self.cached(
            cache_key("update_highest_workload_day", &query, &[&year.to_string()]),
            true,
            hooks,
            CachedValue::as_workload,
            Rc::new(on_update),
            move |api, completion, errors| {
                api.update_highest_workload_day(
                    &query,
                    year,
                    move |workload| {
                        completion.complete(CachedValue::Workload(workload));
                    },
                    errors,
                )
            },
        )
    }

    pub fn update_highest_workload_week(
        &self,
        query: &SensorQuery,
        year: i32,
        on_update: impl Fn(HighestWorkload) + 'static,
        hooks: Hooks,
    ) -> Dispatch {
        let query = query.clone();
        self.cached(
            cache_key("update_highest_workload_week", &query, &[&year.to_string()]),
            true,
            hooks,
            CachedValue::as_workload,
            Rc::new(on_update),
            move |api, completion, errors| {
                api.update_highest_workload_week(
                    &query,
                    year,
                    move |workload| {
                        completion.complete(CachedValue::Workload(workload));
                    },
                    errors,
                )
            },
        )
    }

    pub fn update_highest_workload_month(
        &self,
        query: &SensorQuery,
        year: i32,
        on_update: impl Fn(HighestWorkload) + 'static,
        hooks: Hooks,
    ) -> Dispatch {
        let query = query.clone();
        self.cached(
            cache_key("update_highest_workload_month", &query, &[&year.to_string()]),
            true,
            hooks,
            CachedValue::as_workload,
            Rc::new(on_update),
            move |api, completion, errors| {
                api.update_highest_workload_month(
                    &query,
                    year,
                    move |workload| {
                        completion.complete(CachedValue::Workload(workload));
                    },
                    errors,
                )
            },
        )
    }

    pub fn update_total(
        &self,
        query: &TotalQuery,
        on_update: impl Fn(RunningTotal) + 'static,
        hooks: Hooks,
    ) -> Dispatch {
        let query = query.clone();
        self.cached(
            cache_key("update_total", &query, &[]),
            true,
            hooks,
            CachedValue::as_total,
            Rc::new(on_update),
            move |api, completion, errors| {
                api.update_total(
                    &query,
                    move |total| {
                        completion.complete(CachedValue::Total(total));
                    },
                    errors,
                )
            },
        )
    }

    /// Resolves once; like units, the first date never takes over the observer.
    pub fn get_first_date_ever(
        &self,
        query: &SensorQuery,
        on_success: impl Fn(String) + 'static,
        hooks: Hooks,
    ) -> Dispatch {
        let query = query.clone();
        self.cached(
            cache_key("get_first_date_ever", &query, &[]),
            false,
            hooks,
            CachedValue::as_text,
            Rc::new(on_success),
            move |api, completion, errors| {
                api.get_first_date_ever(
                    &query,
                    move |first| {
                        completion.complete(CachedValue::Text(first));
                    },
                    errors,
                )
            },
        )
    }

    pub fn subscribe_last_update(
        &self,
        query: &SensorQuery,
        on_update: impl Fn(String) + 'static,
        hooks: Hooks,
    ) -> Dispatch {
        let query = query.clone();
        self.cached(
            cache_key("subscribe_last_update", &query, &[]),
            true,
            hooks,
            CachedValue::as_text,
            Rc::new(on_update),
            move |api, completion, errors| {
                api.subscribe_last_update(
                    &query,
                    move |time| {
                        completion.complete(CachedValue::Text(time));
                    },
                    errors,
                )
            },
        )
    }

    /// Units never change, so this call does not take over the key's observer.
    pub fn get_unit_of_measurement(
        &self,
        query: &SensorQuery,
        on_success: impl Fn(UnitOfMeasurement) + 'static,
        hooks: Hooks,
    ) -> Dispatch {
        let query = query.clone();
        self.cached(
            cache_key("get_unit_of_measurement", &query, &[]),
            false,
            hooks,
            CachedValue::as_unit,
            Rc::new(on_success),
            move |api, completion, errors| {
                api.get_unit_of_measurement(
                    &query,
                    move |unit| {
                        completion.complete(CachedValue::Unit(unit));
                    },
                    errors,
                )
            },
        )
    }

    /// One sparse series per time setting, in order. Each setting is its own cache
    /// key; a push update on any of them re-reads all settings from the cache and
    /// calls `on_update` again.
    pub fn update_dataset(
        &self,
        query: &SensorQuery,
        settings: Vec<TimeSetting>,
        on_update: impl Fn(Vec<LabeledSeries>) + 'static,
        hooks: Hooks,
    ) {
        let Hooks {
            on_start,
            on_complete,
            on_error,
        } = hooks;
        if let Some(on_start) = on_start {
            on_start();
        }

        let query = Rc::new(query.clone());
        let settings = Rc::new(settings);
        let on_update = Rc::new(on_update);

        let refresh: ObserverFn<CachedValue> = {
            let this = self.clone();
            let query = Rc::clone(&query);
            let settings = Rc::clone(&settings);
            let on_update = Rc::clone(&on_update);
            let on_error = on_error.clone();
            Rc::new(move |_: &CachedValue| {
                let on_update = Rc::clone(&on_update);
                this.dataset_step(
                    Rc::clone(&query),
                    Rc::clone(&settings),
                    Vec::new(),
                    None,
                    on_error.clone(),
                    Box::new(move |datasets| on_update(datasets)),
                );
            })
        };

        self.dataset_step(
            query,
            settings,
            Vec::new(),
            Some(refresh),
            on_error,
            Box::new(move |datasets| {
                on_update(datasets);
                if let Some(on_complete) = on_complete {
                    on_complete();
                }
            }),
        );
    }

    /// Resolve `settings[collected.len()]`, then recurse until every setting is in.
    fn dataset_step(
        &self,
        query: Rc<SensorQuery>,
        settings: Rc<Vec<TimeSetting>>,
        mut collected: Vec<LabeledSeries>,
        observer: Option<ObserverFn<CachedValue>>,
        on_error: Option<ErrorFn>,
        on_done: Box<dyn FnOnce(Vec<LabeledSeries>)>,
    ) {
        let Some(setting) = settings.get(collected.len()).cloned() else {
            return on_done(collected);
        };
        let key = cache_key("update_dataset", &(&*query, &setting), &[]);
        debug!(key = %key, step = collected.len(), "dataset step");

        let api = self.api.clone();
        let fetch_query = Rc::clone(&query);
        let initiator = on_error.clone();
        let waiter_errors = on_error.clone();
        let rule = observer.clone().map_or(Observe::Keep, Observe::Notify);
        let this = self.clone();

        let mut request = CacheRequest::new(key, move |completion: Completion<CachedValue, ApiError>| {
            let errors = route_errors(completion.clone(), initiator);
            api.update_dataset(
                &fetch_query,
                &setting,
                move |series| {
                    completion.complete(CachedValue::Dataset(series));
                },
                errors,
            );
        })
        .observe(rule)
        .on_ready(move |value| {
            let Some(series) = value.as_dataset() else {
                return;
            };
            collected.push(series);
            this.dataset_step(query, settings, collected, observer, on_error, on_done);
        });
        if let Some(on_error) = waiter_errors {
            request = request.on_error(move |error: &ApiError| on_error(error.clone()));
        }
        self.cache.request(request);
    }

    /// Title plus dataset without caching and without subscriptions.
    pub fn download_data(
        &self,
        query: &SensorQuery,
        setting: &TimeSetting,
        on_success: impl FnOnce(DownloadResult) + 'static,
        hooks: Hooks,
    ) {
        let Hooks {
            on_start,
            on_complete,
            on_error,
        } = hooks;
        if let Some(on_start) = on_start {
            on_start();
        }
        self.api.download_data(
            query,
            setting,
            move |result| {
                on_success(result);
                if let Some(on_complete) = on_complete {
                    on_complete();
                }
            },
            on_error.unwrap_or_else(log_errors),
        );
    }

    /// Cancel every push subscription, then forget every cached value.
    pub fn unsubscribe_everything(&self, on_success: impl FnOnce()) {
        let topics = self.api.unsubscribe_everything();
        self.cache.clear_all();
        debug!(topics = topics.len(), "sensor cache reset");
        on_success();
    }
}
