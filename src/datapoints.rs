//! Typed, timestamped, label-indexed telemetry storage.
//!
//! Every telemetry producer in this crate (power meter, grid charger, …)
//! publishes its readings through a [`DataPointContainer`]. A label maps to
//! at most one live data point; the rendered label text, value text and unit
//! are frozen at insertion time, together with an uptime timestamp.
//!
//! Label sets are declared per subsystem with the [`data_point_labels!`]
//! macro, which generates the label enum, a value enum with one alternative
//! per label, and a marker type per label so that
//! `container.add::<PowerTotal>(value)` is checked at compile time — a value
//! of the wrong type for a label does not compile.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use crate::uptime;

/// A closed set of labels sharing one value enum.
pub trait LabelSet: Copy + Eq + Hash + 'static {
    type Value: Clone + PartialEq + fmt::Debug;

    fn name(self) -> &'static str;
    fn unit(self) -> &'static str;
}

/// Marker type binding one label to its value type.
pub trait Typed: 'static {
    type Set: LabelSet;
    type Value: Clone + fmt::Display + 'static;

    const LABEL: Self::Set;

    fn wrap(value: Self::Value) -> <Self::Set as LabelSet>::Value;
    fn unwrap(value: &<Self::Set as LabelSet>::Value) -> Option<&Self::Value>;
}

/// One reading. Immutable after creation; equality compares raw values only.
#[derive(Debug, Clone)]
pub struct DataPoint<V> {
    label: &'static str,
    value_text: String,
    unit: &'static str,
    value: V,
    timestamp: u32,
}

impl<V> DataPoint<V> {
    pub fn label_text(&self) -> &'static str {
        self.label
    }

    pub fn value_text(&self) -> &str {
        &self.value_text
    }

    pub fn unit_text(&self) -> &'static str {
        self.unit
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }
}

impl<V: PartialEq> PartialEq for DataPoint<V> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

/// Label-indexed map of data points.
///
/// The container itself is not synchronized: owners wrap it in a mutex and
/// hold the guard for the duration of a coherent batch of additions.
/// Producers build a fresh container per frame and [`merge`](Self::merge) it
/// after validation, which makes the merge the linearization point for
/// cross-frame consistency.
#[derive(Debug, Clone)]
pub struct DataPointContainer<S: LabelSet> {
    points: HashMap<S, DataPoint<S::Value>>,
}

impl<S: LabelSet> Default for DataPointContainer<S> {
    fn default() -> Self {
        Self { points: HashMap::new() }
    }
}

impl<S: LabelSet> DataPointContainer<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a reading, stamped with the current uptime. Replaces any prior
    /// entry under the same label.
    pub fn add<T: Typed<Set = S>>(&mut self, value: T::Value) {
        self.add_at::<T>(value, uptime::millis());
    }

    /// Insert a reading with an explicit timestamp.
    pub fn add_at<T: Typed<Set = S>>(&mut self, value: T::Value, timestamp: u32) {
        let point = DataPoint {
            label: T::LABEL.name(),
            value_text: value.to_string(),
            unit: T::LABEL.unit(),
            value: T::wrap(value),
            timestamp,
        };
        self.points.insert(T::LABEL, point);
    }

    pub fn get<T: Typed<Set = S>>(&self) -> Option<T::Value> {
        self.points
            .get(&T::LABEL)
            .and_then(|point| T::unwrap(&point.value))
            .cloned()
    }

    pub fn data_point_for<T: Typed<Set = S>>(&self) -> Option<&DataPoint<S::Value>> {
        self.points.get(&T::LABEL)
    }

    /// Copy every entry from `source` whose value differs from the entry
    /// currently under the same label. Entries with equal values keep their
    /// existing (older) timestamp.
    pub fn merge(&mut self, source: &Self) {
        for (label, point) in &source.points {
            if let Some(existing) = self.points.get(label) {
                if existing == point {
                    continue;
                }
            }
            self.points.insert(*label, point.clone());
        }
    }

    /// Largest timestamp across all entries, or 0 if empty. Computed as
    /// `now - min(now - ts_i)` so it stays correct across counter wraparound.
    pub fn last_update(&self, now: u32) -> u32 {
        if self.points.is_empty() {
            return 0;
        }

        let mut diff = uptime::HALF_RANGE;
        for point in self.points.values() {
            diff = diff.min(uptime::elapsed(now, point.timestamp));
        }
        now.wrapping_sub(diff)
    }

    pub fn last_update_now(&self) -> u32 {
        self.last_update(uptime::millis())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&S, &DataPoint<S::Value>)> {
        self.points.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }
}

/// Declare a label set: label enum, value enum and one marker type per label.
///
/// ```ignore
/// data_point_labels! {
///     pub enum Label: Value {
///         PowerTotal(f32, "Power Total", "W"),
///         Serial(String, "Serial", ""),
///     }
/// }
/// ```
#[macro_export]
macro_rules! data_point_labels {
    (
        $(#[$meta:meta])*
        pub enum $label:ident : $value:ident {
            $( $name:ident ( $ty:ty, $text:literal, $unit:literal ) ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $label {
            $( $name, )+
        }

        #[derive(Debug, Clone, PartialEq)]
        pub enum $value {
            $( $name($ty), )+
        }

        impl $crate::datapoints::LabelSet for $label {
            type Value = $value;

            fn name(self) -> &'static str {
                match self {
                    $( Self::$name => $text, )+
                }
            }

            fn unit(self) -> &'static str {
                match self {
                    $( Self::$name => $unit, )+
                }
            }
        }

        $(
            #[derive(Debug, Clone, Copy)]
            pub struct $name;

            impl $crate::datapoints::Typed for $name {
                type Set = $label;
                type Value = $ty;

                const LABEL: $label = $label::$name;

                fn wrap(value: $ty) -> $value {
                    $value::$name(value)
                }

                fn unwrap(value: &$value) -> Option<&$ty> {
                    match value {
                        $value::$name(inner) => Some(inner),
                        #[allow(unreachable_patterns)]
                        _ => None,
                    }
                }
            }
        )+
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    data_point_labels! {
        pub enum Label: Value {
            Power(f32, "Power", "W"),
            Voltage(f32, "Voltage", "V"),
            Serial(String, "Serial", ""),
        }
    }

    #[test]
    fn add_replaces_prior_entry() {
        let mut container = DataPointContainer::<Label>::new();
        container.add_at::<Power>(100.0, 10);
        container.add_at::<Power>(250.0, 20);

        assert_eq!(container.len(), 1);
        assert_eq!(container.get::<Power>(), Some(250.0));
        assert_eq!(container.data_point_for::<Power>().unwrap().timestamp(), 20);
    }

    #[test]
    fn rendered_texts_are_frozen_at_insertion() {
        let mut container = DataPointContainer::<Label>::new();
        container.add_at::<Voltage>(48.25, 5);

        let point = container.data_point_for::<Voltage>().unwrap();
        assert_eq!(point.label_text(), "Voltage");
        assert_eq!(point.unit_text(), "V");
        assert_eq!(point.value_text(), "48.25");
    }

    #[test]
    fn get_with_absent_label_is_none() {
        let container = DataPointContainer::<Label>::new();
        assert_eq!(container.get::<Serial>(), None);
    }

    #[test]
    fn merge_keeps_timestamp_of_equal_values() {
        let mut a = DataPointContainer::<Label>::new();
        a.add_at::<Power>(100.0, 10);

        let mut b = DataPointContainer::<Label>::new();
        b.add_at::<Power>(100.0, 500);

        a.merge(&b);
        assert_eq!(a.data_point_for::<Power>().unwrap().timestamp(), 10);
    }

    #[test]
    fn merge_overwrites_differing_values() {
        let mut a = DataPointContainer::<Label>::new();
        a.add_at::<Power>(100.0, 10);
        a.add_at::<Voltage>(48.0, 11);

        let mut b = DataPointContainer::<Label>::new();
        b.add_at::<Power>(300.0, 500);

        a.merge(&b);
        assert_eq!(a.get::<Power>(), Some(300.0));
        assert_eq!(a.data_point_for::<Power>().unwrap().timestamp(), 500);
        assert_eq!(a.get::<Voltage>(), Some(48.0));
    }

    #[test]
    fn merge_with_self_is_idempotent() {
        let mut a = DataPointContainer::<Label>::new();
        a.add_at::<Power>(100.0, 10);
        a.add_at::<Serial>("A1".to_string(), 20);

        let copy = a.clone();
        a.merge(&copy);

        assert_eq!(a.data_point_for::<Power>().unwrap().timestamp(), 10);
        assert_eq!(a.data_point_for::<Serial>().unwrap().timestamp(), 20);
    }

    #[test]
    fn last_update_is_zero_when_empty() {
        let container = DataPointContainer::<Label>::new();
        assert_eq!(container.last_update(12345), 0);
    }

    #[test]
    fn last_update_returns_newest_timestamp() {
        let mut container = DataPointContainer::<Label>::new();
        container.add_at::<Power>(100.0, 1_000);
        container.add_at::<Voltage>(48.0, 4_000);

        assert_eq!(container.last_update(10_000), 4_000);
    }

    #[test]
    fn last_update_survives_wraparound() {
        let mut container = DataPointContainer::<Label>::new();
        let near_wrap = u32::MAX - 200;
        container.add_at::<Power>(100.0, near_wrap);

        let now = near_wrap.wrapping_add(500);
        assert_eq!(container.last_update(now), near_wrap);
    }

    proptest! {
        #[test]
        fn merge_is_value_preserving(
            a_power in proptest::option::of(-5000.0f32..5000.0),
            b_power in proptest::option::of(-5000.0f32..5000.0),
            a_voltage in proptest::option::of(0.0f32..65.0),
        ) {
            let mut a = DataPointContainer::<Label>::new();
            if let Some(v) = a_power { a.add_at::<Power>(v, 10); }
            if let Some(v) = a_voltage { a.add_at::<Voltage>(v, 11); }

            let mut b = DataPointContainer::<Label>::new();
            if let Some(v) = b_power { b.add_at::<Power>(v, 100); }

            a.merge(&b);

            prop_assert_eq!(a.get::<Power>(), b_power.or(a_power));
            prop_assert_eq!(a.get::<Voltage>(), a_voltage);
        }
    }
}
