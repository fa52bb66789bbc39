//! Cached operations: single flight, live updates, failures and teardown.

mod helpers;

use std::cell::RefCell;
use std::rc::Rc;

use chrono::NaiveDate;
use helpers::{mock_api, observation, recorder, thing_with_results, today, TOPIC};
use sensorchart::cache::{EntryStatus, FailurePolicy};
use sensorchart::facade::{DaySingle, DaySum, DownloadResult, LabeledSeries, RunningTotal, TotalQuery};
use sensorchart::transport::{FetchError, PushMeta};
use sensorchart::{ApiError, Dispatch, Hooks, SensorCache, SensorQuery, TimeSetting};
use serde_json::json;

const LIVE: PushMeta = PushMeta { retain: false };

fn query() -> SensorQuery {
    SensorQuery::new(7, "").with_default_label("Rad")
}

fn error_log() -> (Rc<RefCell<Vec<ApiError>>>, impl Fn(ApiError) + Clone + 'static) {
    recorder::<ApiError>()
}

#[test]
fn test_concurrent_title_requests_share_one_query() {
    let (api, http, _push, _registry) = mock_api();
    http.route("Things(7)", thing_with_results(today(), &[1.0]));
    http.defer();
    let cache = SensorCache::new(api, FailurePolicy::Stick);

    let (titles, on_title) = recorder::<String>();
    let first = cache.update_title(7, on_title.clone(), Hooks::new());
    let second = cache.update_title(7, on_title.clone(), Hooks::new());

    assert_eq!(first, Dispatch::Fetched);
    assert_eq!(second, Dispatch::Queued { position: 2 });
    assert_eq!(http.request_count(), 1);

    http.flush();
    assert_eq!(*titles.borrow(), vec!["Zaehlstelle Nord", "Zaehlstelle Nord"]);

    assert_eq!(cache.update_title(7, on_title, Hooks::new()), Dispatch::Hit);
    assert_eq!(titles.borrow().len(), 3);
    assert_eq!(http.request_count(), 1);
}

#[test]
fn test_different_parameters_are_different_keys() {
    let (api, http, _push, _registry) = mock_api();
    http.route("Things(7)", thing_with_results(today(), &[1.0]));
    let cache = SensorCache::new(api, FailurePolicy::Stick);

    cache.update_property(7, "city", |_| {}, Hooks::new());
    cache.update_property(7, "lanes", |_| {}, Hooks::new());
    cache.update_title(7, |_| {}, Hooks::new());
    cache.update_property(7, "city", |city| assert_eq!(city, json!("Ulm")), Hooks::new());

    assert_eq!(http.request_count(), 3);
    assert_eq!(cache.coordinator().len(), 3);
}

#[test]
fn test_hooks_run_around_the_value() {
    let (api, http, _push, _registry) = mock_api();
    http.route("Things(7)", thing_with_results(today(), &[1.0]));
    let cache = SensorCache::new(api, FailurePolicy::Stick);

    let (events, record) = recorder::<String>();
    let (start, value, complete) = (record.clone(), record.clone(), record);
    cache.update_description(
        7,
        move |description| value(format!("value:{}", description.len())),
        Hooks::new()
            .on_start(move || start("start".into()))
            .on_complete(move || complete("complete".into())),
    );

    assert_eq!(*events.borrow(), vec!["start", "value:29", "complete"]);
}

#[test]
fn test_live_day_updates_reach_the_latest_caller_only() {
    let (api, http, _push, registry) = mock_api();
    http.route("Things(7)", thing_with_results(today(), &[3.0, 4.0]));
    http.defer();
    let cache = SensorCache::new(api, FailurePolicy::Stick);

    let (first, on_first) = recorder::<DaySum>();
    let (second, on_second) = recorder::<DaySum>();
    cache.update_day(&query(), today(), on_first, Hooks::new());
    cache.update_day(&query(), today(), on_second, Hooks::new());
    http.flush();

    registry.dispatch(TOPIC, &observation("2021-06-01T09:00:00Z", 5.0), &LIVE);

    let totals = |log: &Rc<RefCell<Vec<DaySum>>>| -> Vec<f64> {
        log.borrow().iter().map(|sum| sum.sums["Rad"]).collect()
    };
    assert_eq!(totals(&first), vec![7.0]);
    assert_eq!(totals(&second), vec![7.0, 12.0]);
    // One subscription for the single fetch, however many callers.
    assert_eq!(registry.handler_count(TOPIC), 1);
}

#[test]
fn test_stick_policy_parks_callers_after_a_failure() {
    let (api, http, _push, _registry) = mock_api();
    http.fail("Things(9)", FetchError::Timeout);
    http.defer();
    let cache = SensorCache::new(api, FailurePolicy::Stick);

    let (errors, on_error) = error_log();
    cache.update_title(9, |_| panic!("failed"), Hooks::new().on_error(on_error.clone()));
    cache.update_title(9, |_| panic!("failed"), Hooks::new().on_error(on_error.clone()));
    http.flush();

    assert_eq!(errors.borrow().len(), 2);
    assert!(errors
        .borrow()
        .iter()
        .all(|e| e.operation() == "update_title"));

    let later = cache.update_title(9, |_| panic!("failed"), Hooks::new().on_error(on_error));
    assert_eq!(later, Dispatch::Queued { position: 1 });
    assert_eq!(http.request_count(), 1);
}

#[test]
fn test_retry_policy_fetches_again_after_a_failure() {
    let (api, http, _push, _registry) = mock_api();
    http.fail("Things(9)", FetchError::Network("connection reset".into()));
    let cache = SensorCache::new(api, FailurePolicy::Retry);

    let (errors, on_error) = error_log();
    cache.update_title(9, |_| panic!("failed"), Hooks::new().on_error(on_error));
    assert_eq!(errors.borrow().len(), 1);
    assert!(cache.coordinator().is_empty());

    http.route("Things(9)", json!({ "@iot.id": 9, "name": "Sued" }));
    let (titles, on_title) = recorder::<String>();
    assert_eq!(cache.update_title(9, on_title, Hooks::new()), Dispatch::Fetched);
    assert_eq!(*titles.borrow(), vec!["Sued"]);
}

#[test]
fn test_push_errors_after_resolution_go_to_the_initiator() {
    let (api, http, _push, registry) = mock_api();
    http.route("Things(7)", thing_with_results(today(), &[3.0]));
    let cache = SensorCache::new(api, FailurePolicy::Stick);

    let (errors, on_error) = error_log();
    cache.update_day(&query(), today(), |_| {}, Hooks::new().on_error(on_error));
    registry.dispatch(TOPIC, &json!({ "unexpected": true }), &LIVE);

    assert_eq!(errors.borrow().len(), 1);
    assert!(matches!(errors.borrow()[0], ApiError::Payload { .. }));
    assert_eq!(
        cache.coordinator().status("update_day"),
        EntryStatus::Empty
    );
    assert_eq!(cache.coordinator().len(), 1);
}

#[test]
fn test_unit_of_measurement_is_cached() {
    let (api, http, _push, _registry) = mock_api();
    http.route("Things(7)", thing_with_results(today(), &[3.0]));
    let cache = SensorCache::new(api, FailurePolicy::Stick);

    let (units, on_unit) = recorder::<String>();
    for _ in 0..3 {
        let on_unit = on_unit.clone();
        cache.get_unit_of_measurement(
            &query(),
            move |unit| on_unit(unit.symbol.unwrap_or_default()),
            Hooks::new(),
        );
    }

    assert_eq!(*units.borrow(), vec!["Stk", "Stk", "Stk"]);
    assert_eq!(http.request_count(), 1);
}

#[test]
fn test_dataset_collects_every_setting_and_refreshes_on_push() {
    let (api, http, _push, registry) = mock_api();
    http.route("Things(7)", thing_with_results(today(), &[3.0]));
    http.defer();
    let cache = SensorCache::new(api, FailurePolicy::Stick);

    let settings = vec![
        TimeSetting {
            from: NaiveDate::from_ymd_opt(2021, 5, 31).unwrap(),
            until: NaiveDate::from_ymd_opt(2021, 5, 31).unwrap(),
            interval: None,
        },
        TimeSetting {
            from: today(),
            until: today(),
            interval: None,
        },
    ];
    let (updates, on_update) = recorder::<Vec<LabeledSeries>>();
    let (completed, on_complete) = recorder::<()>();
    cache.update_dataset(
        &query(),
        settings.clone(),
        on_update.clone(),
        Hooks::new().on_complete(move || on_complete(())),
    );

    assert_eq!(http.flush(), 2);
    assert_eq!(updates.borrow().len(), 1);
    assert_eq!(completed.borrow().len(), 1);
    {
        let updates = updates.borrow();
        assert_eq!(updates[0].len(), 2);
        assert!(updates[0][0].contains_key("Rad 31.05.2021"));
        assert!(updates[0][1].contains_key("Rad 01.06.2021"));
    }

    registry.dispatch(TOPIC, &observation("2021-06-01T09:00:00Z", 8.0), &LIVE);
    {
        let updates = updates.borrow();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1][1]["Rad 01.06.2021"]["2021-06-01 09:00:00"], Some(8.0));
    }
    assert_eq!(completed.borrow().len(), 1);

    // Same settings again: served from the cache.
    cache.update_dataset(&query(), settings, on_update, Hooks::new());
    assert_eq!(http.request_count(), 2);
    assert_eq!(updates.borrow().len(), 3);
}

#[test]
fn test_download_bypasses_the_cache() {
    let (api, http, push, _registry) = mock_api();
    http.route("Things(7)", thing_with_results(today(), &[3.0]));
    let cache = SensorCache::new(api, FailurePolicy::Stick);
    let setting = TimeSetting {
        from: today(),
        until: today(),
        interval: None,
    };

    let (downloads, on_download) = recorder::<DownloadResult>();
    cache.download_data(&query(), &setting, on_download.clone(), Hooks::new());
    cache.download_data(&query(), &setting, on_download, Hooks::new());

    assert_eq!(downloads.borrow().len(), 2);
    assert_eq!(http.request_count(), 4);
    assert!(cache.coordinator().is_empty());
    assert!(push.subscriptions().is_empty());
}

#[test]
fn test_unsubscribe_everything_resets_cache_and_subscriptions() {
    let (api, http, push, registry) = mock_api();
    http.route("Things(7)", thing_with_results(today(), &[3.0]));
    let cache = SensorCache::new(api, FailurePolicy::Stick);

    let (sums, on_sum) = recorder::<DaySum>();
    cache.update_day(&query(), today(), on_sum.clone(), Hooks::new());
    cache.update_title(7, |_| {}, Hooks::new());
    assert_eq!(push.subscriptions(), vec![TOPIC]);

    let (done, on_done) = recorder::<()>();
    cache.unsubscribe_everything(move || on_done(()));

    assert_eq!(done.borrow().len(), 1);
    assert!(cache.coordinator().is_empty());
    assert!(push.subscriptions().is_empty());
    registry.dispatch(TOPIC, &observation("2021-06-01T09:00:00Z", 1.0), &LIVE);
    assert_eq!(sums.borrow().len(), 1);

    assert_eq!(
        cache.update_day(&query(), today(), on_sum, Hooks::new()),
        Dispatch::Fetched
    );
    assert_eq!(http.request_count(), 3);
}

#[test]
fn test_default_label_is_part_of_the_key() {
    let (api, http, _push, _registry) = mock_api();
    http.route("Things(7)", thing_with_results(today(), &[3.0]));
    let cache = SensorCache::new(api, FailurePolicy::Stick);

    let labels = |query: SensorQuery| {
        let (sums, on_sum) = recorder::<DaySum>();
        cache.update_day(&query, today(), on_sum, Hooks::new());
        let labels: Vec<String> = sums.borrow()[0].sums.keys().cloned().collect();
        labels
    };
    let rad = labels(SensorQuery::new(7, "").with_default_label("Rad"));
    let kfz = labels(SensorQuery::new(7, "").with_default_label("Kfz"));

    assert_eq!(rad, vec!["Rad"]);
    assert_eq!(kfz, vec!["Kfz"]);
    assert_eq!(http.request_count(), 2);
    assert_eq!(cache.coordinator().len(), 2);
}

#[test]
fn test_dataset_interval_is_part_of_the_key() {
    let (api, http, _push, _registry) = mock_api();
    http.route("Things(7)", thing_with_results(today(), &[3.0]));
    let cache = SensorCache::new(api, FailurePolicy::Stick);
    let past = NaiveDate::from_ymd_opt(2021, 5, 20).unwrap();

    for interval in [None, Some(String::new()), Some("15-Min".to_string())] {
        let setting = TimeSetting {
            from: past,
            until: past,
            interval,
        };
        cache.update_dataset(&query(), vec![setting], |_| {}, Hooks::new());
    }

    assert_eq!(http.request_count(), 3);
    assert_eq!(cache.coordinator().len(), 3);
}

#[test]
fn test_day_single_is_cached() {
    let (api, http, _push, _registry) = mock_api();
    let day = NaiveDate::from_ymd_opt(2021, 5, 20).unwrap();
    http.route("Things(7)", thing_with_results(day, &[6.0]));
    let cache = SensorCache::new(api, FailurePolicy::Stick);

    let (singles, on_single) = recorder::<DaySingle>();
    cache.update_day_single(&query(), day, on_single.clone(), Hooks::new());
    assert_eq!(
        cache.update_day_single(&query(), day, on_single, Hooks::new()),
        Dispatch::Hit
    );

    assert_eq!(http.request_count(), 1);
    let values: Vec<String> = singles.borrow().iter().map(|s| s.values["Rad"].clone()).collect();
    assert_eq!(values, vec!["6 Stk", "6 Stk"]);
}

#[test]
fn test_total_is_shared_and_live_updates_reach_the_latest_caller() {
    let (api, http, _push, registry) = mock_api();
    http.route("1-Woche", thing_with_results(NaiveDate::from_ymd_opt(2021, 5, 3).unwrap(), &[10.0]));
    http.route("15-Min", thing_with_results(today(), &[2.0]));
    http.defer();
    let cache = SensorCache::new(api, FailurePolicy::Stick);
    let totals_query = TotalQuery {
        thing_id: 7,
        weekly_filter: "properties/layerName eq 'Rad_1-Woche'".into(),
        recent_filter: "properties/layerName eq 'Rad_15-Min'".into(),
    };

    let (first, on_first) = recorder::<RunningTotal>();
    let (second, on_second) = recorder::<RunningTotal>();
    cache.update_total(&totals_query, on_first, Hooks::new());
    cache.update_total(&totals_query, on_second, Hooks::new());
    assert_eq!(http.flush(), 2);

    registry.dispatch(TOPIC, &observation("2021-06-01T09:00:00Z", 1.0), &LIVE);

    let sums = |log: &Rc<RefCell<Vec<RunningTotal>>>| -> Vec<f64> {
        log.borrow().iter().map(|total| total.sum).collect()
    };
    assert_eq!(sums(&first), vec![12.0]);
    assert_eq!(sums(&second), vec![12.0, 13.0]);
    assert_eq!(second.borrow()[1].first_date, "2021-05-03");
}

#[test]
fn test_first_date_ever_is_fetched_once() {
    let (api, http, _push, _registry) = mock_api();
    http.route("Things(7)", thing_with_results(NaiveDate::from_ymd_opt(2019, 4, 12).unwrap(), &[1.0]));
    let cache = SensorCache::new(api, FailurePolicy::Stick);

    let (dates, on_date) = recorder::<String>();
    cache.get_first_date_ever(&query(), on_date.clone(), Hooks::new());
    cache.get_first_date_ever(&query(), on_date, Hooks::new());
    // Same thing and query, different operation.
    cache.update_title(7, |_| {}, Hooks::new());

    assert_eq!(*dates.borrow(), vec!["2019-04-12", "2019-04-12"]);
    assert_eq!(http.request_count(), 2);
}
