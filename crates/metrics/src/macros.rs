/// Register a histogram with the workspace metrics registry and store it in
/// a static variable. An optional third argument specifies labels. The
/// reported metric name is the lower_snake_case version of the declared
/// variable name.
#[macro_export]
macro_rules! register_sync_histogram {
    ($VIS:vis $NAME:ident, $HELP:literal $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::Histogram> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    $crate::register_histogram(stringify!([<$NAME:lower>]), $HELP)
                }
            });
    };
    ($VIS:vis $NAME:ident, $HELP:literal, $LABELS:expr $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::HistogramVec> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    $crate::register_histogram_vec(stringify!([<$NAME:lower>]), $HELP, $LABELS)
                }
            });
    };
}

/// Register an integer counter with the workspace metrics registry and store
/// it in a static variable. An optional third argument specifies labels.
#[macro_export]
macro_rules! register_sync_counter {
    ($VIS:vis $NAME:ident, $HELP:literal $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::IntCounter> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    $crate::register_counter(stringify!([<$NAME:lower>]), $HELP)
                }
            });
    };
    ($VIS:vis $NAME:ident, $HELP:literal, $LABELS:expr $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::IntCounterVec> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    $crate::register_counter_vec(stringify!([<$NAME:lower>]), $HELP, $LABELS)
                }
            });
    };
}

/// Register a floating-point gauge with the workspace metrics registry and
/// store it in a static variable. An optional third argument specifies
/// labels.
#[macro_export]
macro_rules! register_sync_gauge {
    ($VIS:vis $NAME:ident, $HELP:literal $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::Gauge> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    $crate::register_gauge(stringify!([<$NAME:lower>]), $HELP)
                }
            });
    };
    ($VIS:vis $NAME:ident, $HELP:literal, $LABELS:expr $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::GaugeVec> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    $crate::register_gauge_vec(stringify!([<$NAME:lower>]), $HELP, $LABELS)
                }
            });
    };
}
