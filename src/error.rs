use thiserror::Error;

/// Failures of a resolver run. All of them abort the run: a schedule that is
/// internally inconsistent must not produce a partial trip-to-line mapping.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("trip '{trip_id}' references route '{route_id}' which is missing from routes")]
    UnknownRoute { trip_id: String, route_id: String },
    #[error("impossible to read '{file_name}'")]
    NamedFileIO {
        file_name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("impossible to read csv file '{file_name}'")]
    CSVError {
        file_name: String,
        #[source]
        source: csv::Error,
    },
    #[error("csv file '{file_name}' has no '{column}' column")]
    MissingColumn { file_name: String, column: String },
}

/// Failures turning one capture into a snapshot. Callers skip the capture.
#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("invalid GTFS-RT protobuf")]
    Decode(#[from] prost::DecodeError),
    #[error("feed header carries no timestamp")]
    MissingTimestamp,
}

/// Failure of a single HTTP attempt.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("invalid url '{0}'")]
    InvalidUrl(String),
    #[error("request failed")]
    Http(#[from] reqwest::Error),
    #[error("provider answered {0}")]
    Unavailable(reqwest::StatusCode),
}
