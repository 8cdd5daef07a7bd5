use std::io;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use crate::engine::{Engine, EngineError};
use crate::limits::MAX_LINE_LEN;
use crate::model::*;
use crate::observability;
use crate::registry::{StoreManager, DEFAULT_STORE};
use crate::sql::{self, Command};

/// One JSON line answered per command line.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply {
    Ok {
        tag: &'static str,
        rows: Vec<serde_json::Value>,
    },
    Reserved {
        reservation: ReservationInfo,
        blackout_warning: bool,
        blackouts: Vec<BlackoutInfo>,
    },
    /// The chair was taken. Expected under contention, not a failure.
    Conflict {
        message: String,
    },
    Error {
        code: &'static str,
        message: String,
    },
}

impl Reply {
    fn done(tag: &'static str) -> Self {
        Reply::Ok { tag, rows: Vec::new() }
    }

    fn rows<T: Serialize>(tag: &'static str, items: &[T]) -> Self {
        match items
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(rows) => Reply::Ok { tag, rows },
            Err(e) => Reply::Error {
                code: "internal",
                message: e.to_string(),
            },
        }
    }

    fn status(&self) -> &'static str {
        match self {
            Reply::Ok { .. } | Reply::Reserved { .. } => "ok",
            Reply::Conflict { .. } => "conflict",
            Reply::Error { .. } => "error",
        }
    }
}

impl From<EngineError> for Reply {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Conflict { .. } => Reply::Conflict { message: e.to_string() },
            other => Reply::Error {
                code: other.code(),
                message: other.to_string(),
            },
        }
    }
}

impl From<Reserved> for Reply {
    fn from(r: Reserved) -> Self {
        Reply::Reserved {
            blackout_warning: r.has_blackout_warning(),
            reservation: r.reservation,
            blackouts: r.blackouts,
        }
    }
}

/// Per-connection state: the selected store.
struct Session {
    stores: Arc<StoreManager>,
    store: String,
    engine: Option<Arc<Engine>>,
}

impl Session {
    fn new(stores: Arc<StoreManager>) -> Self {
        Self {
            stores,
            store: DEFAULT_STORE.to_string(),
            engine: None,
        }
    }

    fn engine(&mut self) -> io::Result<Arc<Engine>> {
        if let Some(engine) = &self.engine {
            return Ok(engine.clone());
        }
        let engine = self.stores.get_or_create(&self.store)?;
        self.engine = Some(engine.clone());
        Ok(engine)
    }

    async fn handle_line(&mut self, line: &str) -> Reply {
        let cmd = match sql::parse_sql(line) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(observability::QUERIES_TOTAL, "command" => "invalid", "status" => "error")
                    .increment(1);
                return Reply::Error {
                    code: "syntax_error",
                    message: e.to_string(),
                };
            }
        };

        let label = observability::command_label(&cmd);
        let start = Instant::now();
        let reply = self.execute(cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => reply.status())
            .increment(1);
        reply
    }

    async fn execute(&mut self, cmd: Command) -> Reply {
        if let Command::Use { store } = cmd {
            return match self.stores.get_or_create(&store) {
                Ok(engine) => {
                    tracing::debug!("session switched to store {store}");
                    self.store = store;
                    self.engine = Some(engine);
                    Reply::done("USE")
                }
                Err(e) => Reply::Error {
                    code: "store_error",
                    message: e.to_string(),
                },
            };
        }

        let engine = match self.engine() {
            Ok(engine) => engine,
            Err(e) => {
                return Reply::Error {
                    code: "store_error",
                    message: e.to_string(),
                };
            }
        };
        execute_command(&engine, cmd).await.unwrap_or_else(Reply::from)
    }
}

async fn execute_command(engine: &Engine, cmd: Command) -> Result<Reply, EngineError> {
    match cmd {
        // Handled by the session.
        Command::Use { .. } => Ok(Reply::done("USE")),
        Command::InsertLocation { id, name } => {
            engine.create_location(id, name).await?;
            Ok(Reply::done("INSERT"))
        }
        Command::InsertChair { key, name } => {
            engine.create_chair(key, name).await?;
            Ok(Reply::done("INSERT"))
        }
        Command::InsertService { id, price_cents, paid, kind } => {
            engine.create_service(id, price_cents, paid, kind).await?;
            Ok(Reply::done("INSERT"))
        }
        Command::LinkService { key, service_id } => {
            engine.link_service(key, service_id).await?;
            Ok(Reply::done("INSERT"))
        }
        Command::InsertTournament { id, name, start, end } => {
            engine.add_blackout(id, name, Span::new(start, end)).await?;
            Ok(Reply::done("INSERT"))
        }
        Command::Reserve { user_id, key, start, end } => {
            let reserved = engine.reserve(user_id, key, Span::new(start, end)).await?;
            Ok(reserved.into())
        }
        Command::AttachServices {
            key,
            user_id,
            reservation_id,
            service_ids,
        } => {
            let row_ids = engine
                .attach_services(key, user_id, reservation_id, &service_ids)
                .await?;
            let rows: Vec<_> = row_ids
                .into_iter()
                .map(|row_id| serde_json::json!({ "row_id": row_id.to_string() }))
                .collect();
            Ok(Reply::Ok { tag: "INSERT", rows })
        }
        Command::AttachDrink {
            user_id,
            reservation_id,
            service_id,
            quantity,
        } => {
            let row_id = engine
                .attach_drink(user_id, reservation_id, service_id, quantity)
                .await?;
            let rows = vec![serde_json::json!({ "row_id": row_id.to_string() })];
            Ok(Reply::Ok { tag: "INSERT", rows })
        }
        Command::RecordUsage { reservation_id, hours } => {
            let usage = engine.record_usage(reservation_id, hours).await?;
            Ok(Reply::rows("INSERT", &[usage]))
        }
        Command::SelectLocations => Ok(Reply::rows("SELECT", &engine.list_locations())),
        Command::SelectServices => Ok(Reply::rows("SELECT", &engine.list_services())),
        Command::SelectTournaments { window } => match window {
            None => Ok(Reply::rows("SELECT", &engine.list_blackouts())),
            Some((start, end)) => {
                let span = Span::new(start, end);
                if !span.is_ordered() {
                    return Err(EngineError::InvalidRange("begin is after end"));
                }
                Ok(Reply::rows("SELECT", &engine.blackouts_overlapping(&span)))
            }
        },
        Command::SelectChairs { location_id } => {
            Ok(Reply::rows("SELECT", &engine.list_chairs(location_id).await?))
        }
        Command::SelectAvailability {
            location_id,
            chair_id,
            start,
            end,
        } => {
            let span = Span::new(start, end);
            match chair_id {
                None => Ok(Reply::rows("SELECT", &engine.list_available(location_id, span).await?)),
                Some(chair_id) => {
                    let available = engine
                        .is_available(ChairKey::new(location_id, chair_id), span)
                        .await?;
                    let row = Availability { location_id, chair_id, available };
                    Ok(Reply::rows("SELECT", &[row]))
                }
            }
        }
        Command::SelectReservation { id } => {
            Ok(Reply::rows("SELECT", &[engine.get_reservation(id).await?]))
        }
        Command::SelectReservations { key } => {
            Ok(Reply::rows("SELECT", &engine.list_reservations(key).await?))
        }
        Command::SelectUsageWindow {
            reservation_id,
            check_date,
        } => {
            let allowed = engine.is_within_usage_window(reservation_id, check_date).await?;
            let row = WindowCheck {
                reservation_id,
                check_date,
                allowed,
            };
            Ok(Reply::rows("SELECT", &[row]))
        }
        Command::SelectReservationServices { reservation_id } => Ok(Reply::rows(
            "SELECT",
            &engine.service_attachments(reservation_id).await?,
        )),
        Command::SelectReservationDrinks { reservation_id } => Ok(Reply::rows(
            "SELECT",
            &engine.drink_attachments(reservation_id).await?,
        )),
        Command::SelectUnbookedServices { reservation_id } => Ok(Reply::rows(
            "SELECT",
            &engine.unbooked_services(reservation_id).await?,
        )),
        Command::SelectCharges { reservation_id } => {
            Ok(Reply::rows("SELECT", &[engine.charges(reservation_id).await?]))
        }
        Command::SelectChairServices { key } => {
            Ok(Reply::rows("SELECT", &engine.chair_services(key).await?))
        }
        Command::SelectUsageStats { key } => {
            Ok(Reply::rows("SELECT", &[engine.usage_stats(key).await?]))
        }
    }
}

fn codec_err(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

async fn send_reply<S>(framed: &mut Framed<S, LinesCodec>, reply: &Reply) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let line = serde_json::to_string(reply).map_err(io::Error::other)?;
    framed.send(line).await.map_err(codec_err)
}

/// Serve one client: read command lines, answer each with one JSON line,
/// until the client hangs up.
pub async fn process_connection<S>(stream: S, stores: Arc<StoreManager>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let mut session = Session::new(stores);

    while let Some(line) = framed.next().await {
        let line = match line {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                let reply = Reply::Error {
                    code: "limit_exceeded",
                    message: format!("line longer than {MAX_LINE_LEN} bytes"),
                };
                send_reply(&mut framed, &reply).await?;
                continue;
            }
            Err(LinesCodecError::Io(e)) => return Err(e),
        };
        if line.trim().is_empty() {
            continue;
        }
        let reply = session.handle_line(&line).await;
        send_reply(&mut framed, &reply).await?;
    }
    tracing::debug!("client on store {} disconnected", session.store);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::DEFAULT_LOCK_TIMEOUT;
    use std::path::PathBuf;
    use tokio_test::io::Builder;

    fn stores(name: &str) -> Arc<StoreManager> {
        let dir: PathBuf = std::env::temp_dir().join("strandkorb_test_wire").join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        Arc::new(StoreManager::new(dir, 1000, DEFAULT_LOCK_TIMEOUT))
    }

    const DONE_INSERT: &[u8] = b"{\"status\":\"ok\",\"tag\":\"INSERT\",\"rows\":[]}\n";

    #[tokio::test]
    async fn provisioning_lines_answer_ok() {
        let mock = Builder::new()
            .read(b"INSERT INTO locations (id, name) VALUES (1, 'Nordstrand')\n")
            .write(DONE_INSERT)
            .read(b"INSERT INTO chairs (location_id, chair_id) VALUES (1, 5)\n")
            .write(DONE_INSERT)
            .read(b"SELECT * FROM locations\n")
            .write(b"{\"status\":\"ok\",\"tag\":\"SELECT\",\"rows\":[{\"id\":1,\"name\":\"Nordstrand\"}]}\n")
            .build();
        process_connection(mock, stores("provisioning")).await.unwrap();
    }

    #[tokio::test]
    async fn reservation_then_conflict() {
        let mock = Builder::new()
            .read(b"INSERT INTO locations (id, name) VALUES (1, 'Nordstrand')\n")
            .write(DONE_INSERT)
            .read(b"INSERT INTO chairs (location_id, chair_id) VALUES (1, 5)\n")
            .write(DONE_INSERT)
            .read(b"INSERT INTO reservations (user_id, location_id, chair_id, start, \"end\") VALUES (42, 1, 5, '2024-07-01', '2024-07-03')\n")
            .write(b"{\"status\":\"reserved\",\"reservation\":{\"id\":1,\"user_id\":42,\"location_id\":1,\"chair_id\":5,\"start\":1719792000000,\"end\":1719964800000},\"blackout_warning\":false,\"blackouts\":[]}\n")
            .read(b"INSERT INTO reservations (user_id, location_id, chair_id, start, \"end\") VALUES (43, 1, 5, '2024-07-03', '2024-07-05')\n")
            .write(b"{\"status\":\"conflict\",\"message\":\"chair 5 at location 1 is not available: overlaps reservation 1\"}\n")
            .build();
        process_connection(mock, stores("conflict")).await.unwrap();
    }

    #[tokio::test]
    async fn syntax_error_keeps_connection_open() {
        let mock = Builder::new()
            .read(b"SELECT * FROM boats\n")
            .write(b"{\"status\":\"error\",\"code\":\"syntax_error\",\"message\":\"unknown table: boats\"}\n")
            .read(b"\n")
            .read(b"SELECT * FROM services\n")
            .write(b"{\"status\":\"ok\",\"tag\":\"SELECT\",\"rows\":[]}\n")
            .build();
        process_connection(mock, stores("syntax_error")).await.unwrap();
    }

    #[tokio::test]
    async fn engine_errors_carry_codes() {
        let mock = Builder::new()
            .read(b"SELECT * FROM reservations WHERE id = 9\n")
            .write(b"{\"status\":\"error\",\"code\":\"not_found\",\"message\":\"not found: reservation 9\"}\n")
            .build();
        process_connection(mock, stores("error_codes")).await.unwrap();
    }

    #[tokio::test]
    async fn use_switches_store() {
        let sm = stores("use_store");
        let mock = Builder::new()
            .read(b"USE sylt\n")
            .write(b"{\"status\":\"ok\",\"tag\":\"USE\",\"rows\":[]}\n")
            .read(b"INSERT INTO locations (id, name) VALUES (1, 'Westerland')\n")
            .write(DONE_INSERT)
            .build();
        process_connection(mock, sm.clone()).await.unwrap();

        let sylt = sm.get_or_create("sylt").unwrap();
        assert_eq!(sylt.list_locations().len(), 1);
        let default = sm.get_or_create(DEFAULT_STORE).unwrap();
        assert!(default.list_locations().is_empty());
    }

    #[test]
    fn engine_conflict_maps_to_conflict_reply() {
        let reply = Reply::from(EngineError::Conflict {
            chair: ChairKey::new(1, 5),
            existing: 3,
        });
        assert_eq!(reply.status(), "conflict");
        let reply = Reply::from(EngineError::InvalidRange("begin is after end"));
        match reply {
            Reply::Error { code, .. } => assert_eq!(code, "invalid_range"),
            other => panic!("expected error reply, got {other:?}"),
        }
    }
}
