//! Connection operations as [`TaskChain`] steps.
//!
//! ```ignore
//! let mut chain = TaskChain::new();
//! steps::open_step(&mut chain, &cx);
//! steps::query_step(&mut chain, &cx, "SELECT 1", |result| println!("{result:?}"));
//! steps::close_step(&mut chain, &cx);
//! let outcome = chain.run(&mut conn).await;
//! ```

use asupersync::Cx;

use mysqlwire_core::TaskChain;

use crate::connection::{Connection, QueryResult};
use crate::io::Transport;

/// Chain over a connection.
pub type ConnectionChain<S> = TaskChain<Connection<S>>;

/// Add a step that connects and authenticates.
pub fn open_step<'c, S>(
    chain: &'c mut ConnectionChain<S>,
    cx: &Cx,
) -> &'c mut ConnectionChain<S>
where
    S: Transport + 'static,
{
    let cx = cx.clone();
    chain.add_task("open", move |conn, _step| {
        Box::pin(async move { conn.connect(&cx).await })
    })
}

/// Add a step that sends quit and releases the socket.
pub fn close_step<'c, S>(
    chain: &'c mut ConnectionChain<S>,
    cx: &Cx,
) -> &'c mut ConnectionChain<S>
where
    S: Transport + 'static,
{
    let cx = cx.clone();
    chain.add_task("close", move |conn, _step| {
        Box::pin(async move { conn.disconnect(&cx).await })
    })
}

/// Add a step that pings the server.
pub fn ping_step<'c, S>(
    chain: &'c mut ConnectionChain<S>,
    cx: &Cx,
) -> &'c mut ConnectionChain<S>
where
    S: Transport + 'static,
{
    let cx = cx.clone();
    chain.add_task("ping", move |conn, _step| {
        Box::pin(async move { conn.ping(&cx).await })
    })
}

/// Add a step that runs `sql` and hands the first result to `on_result`.
pub fn query_step<'c, S, F>(
    chain: &'c mut ConnectionChain<S>,
    cx: &Cx,
    sql: impl Into<String>,
    on_result: F,
) -> &'c mut ConnectionChain<S>
where
    S: Transport + 'static,
    F: FnOnce(QueryResult) + 'static,
{
    let cx = cx.clone();
    let sql = sql.into();
    chain.add_task("query", move |conn, _step| {
        Box::pin(async move { conn.query(&cx, &sql).await.map(on_result) })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use mysqlwire_core::{ChainOutcome, FailurePolicy, Outcome};

    use crate::config::ConnectionConfig;
    use crate::mock::{MockStream, block_on};
    use crate::protocol::Command;
    use crate::protocol::packets::tests::{SERVER_CAPS, greeting_payload};

    fn frame(sequence_id: u8, payload: &[u8]) -> Vec<u8> {
        let len = payload.len() as u32;
        let mut bytes = vec![len as u8, (len >> 8) as u8, (len >> 16) as u8, sequence_id];
        bytes.extend_from_slice(payload);
        bytes
    }

    const OK: [u8; 7] = [0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00];

    fn greeting() -> Vec<u8> {
        frame(0, &greeting_payload(7, b"ABCD1234efgh5678ijkl", SERVER_CAPS))
    }

    fn connection(stream: MockStream) -> Connection<MockStream> {
        let config = ConnectionConfig::new().user("app").password("secret");
        Connection::with_stream(config, stream).unwrap()
    }

    #[test]
    fn test_open_query_close() {
        let stream = MockStream::new()
            .with_incoming(&greeting())
            .with_incoming(&frame(2, &OK))
            .with_incoming(&frame(1, &[0x00, 0x03, 0x00, 0x02, 0x00, 0x00, 0x00]));
        let log = stream.handle();
        let mut conn = connection(stream);
        let cx = Cx::for_testing();

        let affected = Rc::new(RefCell::new(None));
        let seen = Rc::clone(&affected);
        let begun = Rc::new(RefCell::new(Vec::new()));
        let begun_hook = Rc::clone(&begun);

        let mut chain = TaskChain::new();
        open_step(&mut chain, &cx);
        query_step(&mut chain, &cx, "UPDATE t SET x = 1", move |result| {
            *seen.borrow_mut() = Some(result.affected_rows());
        });
        close_step(&mut chain, &cx);
        chain.when_task_begin(move |index, name| {
            begun_hook.borrow_mut().push(format!("{index}:{name}"));
        });

        let outcome = block_on(chain.run(&mut conn));
        assert!(outcome.is_completed(), "{outcome:?}");
        assert_eq!(*begun.borrow(), vec!["0:open", "1:query", "2:close"]);
        assert_eq!(*affected.borrow(), Some(3));
        assert!(conn.connected_success());
        assert!(log.borrow().written.ends_with(&[1, 0, 0, 0, Command::Quit as u8]));
    }

    #[test]
    fn test_failed_open_short_circuits() {
        let mut denied = vec![0xFF, 0x15, 0x04, b'#'];
        denied.extend_from_slice(b"28000Access denied");
        let stream = MockStream::new()
            .with_incoming(&greeting())
            .with_incoming(&frame(2, &denied));
        let mut conn = connection(stream);
        let cx = Cx::for_testing();

        let ran_query = Rc::new(RefCell::new(false));
        let flag = Rc::clone(&ran_query);
        let mut chain = TaskChain::new();
        open_step(&mut chain, &cx);
        query_step(&mut chain, &cx, "SELECT 1", move |_| *flag.borrow_mut() = true);

        match block_on(chain.run(&mut conn)) {
            ChainOutcome::Failed { index, name, error } => {
                assert_eq!(index, 0);
                assert_eq!(name, "open");
                assert!(error.is_authentication_error());
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(!*ran_query.borrow());
        assert!(!conn.connected_success());
    }

    #[test]
    fn test_continue_policy_records_failures() {
        let mut conn = connection(MockStream::new());
        let cx = Cx::for_testing();

        let mut chain = TaskChain::new().failure_policy(FailurePolicy::Continue);
        open_step(&mut chain, &cx);
        ping_step(&mut chain, &cx);

        match block_on(chain.run(&mut conn)) {
            ChainOutcome::Completed { steps, failures } => {
                assert_eq!(steps, 2);
                assert_eq!(failures.len(), 2);
                assert_eq!(failures[1].name, "ping");
                assert!(failures[1].error.is_programming_error());
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn test_step_can_queue_follow_up() {
        let stream = MockStream::new()
            .with_incoming(&greeting())
            .with_incoming(&frame(2, &OK))
            .with_incoming(&frame(1, &OK));
        let mut conn = connection(stream);
        let cx = Cx::for_testing();
        let ping_cx = cx.clone();

        let mut chain = TaskChain::new();
        open_step(&mut chain, &cx);
        chain.add_task("maybe-ping", move |conn, step| {
            if conn.is_ready() {
                step.add_task("ping", move |conn, _step| {
                    Box::pin(async move { conn.ping(&ping_cx).await })
                });
            }
            Box::pin(async { Outcome::Ok(()) })
        });

        let outcome = block_on(chain.run(&mut conn));
        assert!(outcome.is_completed());
        assert_eq!(chain.task_names(), vec!["open", "maybe-ping", "ping"]);
    }
}
