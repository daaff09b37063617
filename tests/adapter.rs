//! facade level behavior: admin statements, read only policy, statement
//! cache bounds, transaction debts and the pool check-in hook.

mod common;

use postgres_pipeline::{
    error::{PreparedStatementCacheExpired, ReadOnlyError},
    pool::Pool,
    types::Type,
};

use common::*;

#[tokio::test]
async fn read_only_rejects_writes_before_transmission() {
    // the script ends at the handshake: a write must fail without any
    // traffic reaching the backend
    let (adapter, _backend) = connect("user=tester dbname=app read_only=on").await;

    let err = adapter
        .execute("INSERT INTO users (id) VALUES (1)", "User Create")
        .await
        .unwrap_err();
    assert!(err.downcast_ref::<ReadOnlyError>().is_some());

    let err = adapter
        .exec_query("UPDATE users SET name = 'x'", "User Update", &[], false)
        .await
        .unwrap_err();
    let err = err.downcast_ref::<ReadOnlyError>().unwrap();
    assert_eq!(err.sql(), "UPDATE users SET name = 'x'");
}

#[tokio::test]
async fn raw_query_returns_text_rows() {
    let (adapter, mut backend) = connect_default().await;

    let server = tokio::spawn(async move {
        let (tag, body) = backend.recv().await;
        assert_eq!(tag, b'Q');
        assert_eq!(query_text(&body), "SELECT id, name FROM users");
        backend
            .send(&[
                row_description(&[("id", 23), ("name", 25)]),
                data_row(&[Some(&b"3"[..]), Some(&b"three"[..])]),
                data_row(&[Some(&b"4"[..]), None]),
                command_complete("SELECT 2"),
                ready(b'I'),
            ])
            .await;
    });

    let rows = adapter.query("SELECT id, name FROM users", "SQL").await.unwrap();
    assert_eq!(
        rows,
        vec![
            vec![Some("3".to_string()), Some("three".to_string())],
            vec![Some("4".to_string()), None],
        ]
    );

    server.await.unwrap();
}

#[tokio::test]
async fn typed_binds_are_transmitted_and_kept() {
    let (adapter, mut backend) = connect_default().await;

    let server = tokio::spawn(async move {
        let msgs = backend.recv_until_sync().await;
        assert_eq!(msgs[0].0, b'P');
        // Parse carries the declared parameter type
        backend
            .send(&[
                parse_complete(),
                bind_complete(),
                parameter_description(&[23]),
                row_description(&[("id", 23)]),
                data_row(&[Some(&int4(3))]),
                command_complete("SELECT 1"),
                ready(b'I'),
            ])
            .await;
    });

    let handle = adapter
        .exec_query(
            "SELECT id FROM users WHERE id = $1",
            "User Load",
            &[(&3i32, Type::INT4)],
            false,
        )
        .await
        .unwrap();

    let row = handle.first().await.unwrap().unwrap();
    assert_eq!(row.get::<i32>(0), 3);

    server.await.unwrap();
}

#[tokio::test]
async fn statement_limit_evicts_and_deallocates() {
    let (adapter, mut backend) = connect("user=tester dbname=app statement_limit=1").await;

    let server = tokio::spawn(async move {
        // first statement prepared and executed
        let msgs = backend.recv_until_sync().await;
        assert_eq!(parse_statement_name(&msgs[0].1), "a1");
        backend
            .send(&[
                parse_complete(),
                parameter_description(&[]),
                row_description(&[("x", 23)]),
                ready(b'I'),
            ])
            .await;

        backend.recv_until_sync().await;
        backend
            .send(&[
                bind_complete(),
                data_row(&[Some(&int4(1))]),
                command_complete("SELECT 1"),
                ready(b'I'),
            ])
            .await;

        // second statement: prepare under a fresh name, then the first entry
        // is pushed out and deallocated
        let msgs = backend.recv_until_sync().await;
        assert_eq!(parse_statement_name(&msgs[0].1), "a2");
        backend
            .send(&[
                parse_complete(),
                parameter_description(&[]),
                row_description(&[("y", 23)]),
                ready(b'I'),
            ])
            .await;

        let msgs = backend.recv_until_sync().await;
        assert_eq!(msgs[0].0, b'C');
        assert_eq!(close_statement_name(&msgs[0].1), "a1");
        backend.send(&[close_complete(), ready(b'I')]).await;

        backend.recv_until_sync().await;
        backend
            .send(&[
                bind_complete(),
                data_row(&[Some(&int4(2))]),
                command_complete("SELECT 1"),
                ready(b'I'),
            ])
            .await;
    });

    let h1 = adapter.select_all("SELECT x FROM a", &[]).await.unwrap();
    let h2 = adapter.select_all("SELECT y FROM b", &[]).await.unwrap();

    assert_eq!(h2.first().await.unwrap().unwrap().get::<i32>(0), 2);
    assert_eq!(h1.first().await.unwrap().unwrap().get::<i32>(0), 1);
    assert_eq!(adapter.cached_statements().await, 1);

    server.await.unwrap();
}

#[tokio::test]
async fn cache_expiry_inside_transaction_is_not_retried() {
    let (adapter, mut backend) = connect_default().await;

    let server = tokio::spawn(async move {
        let (tag, _) = backend.recv().await;
        assert_eq!(tag, b'Q');
        backend.send(&[command_complete("BEGIN"), ready(b'T')]).await;

        backend.recv_until_sync().await;
        backend
            .send(&[
                parse_complete(),
                parameter_description(&[]),
                row_description(&[("id", 23)]),
                ready(b'T'),
            ])
            .await;

        backend.recv_until_sync().await;
        backend
            .send(&[
                error_response("0A000", "cached plan must not change result type"),
                ready(b'E'),
            ])
            .await;

        let (tag, body) = backend.recv().await;
        assert_eq!(tag, b'Q');
        assert_eq!(query_text(&body), "ROLLBACK");
        backend.send(&[command_complete("ROLLBACK"), ready(b'I')]).await;
    });

    let tx = adapter.begin().await.unwrap();
    let handle = adapter.select_all("SELECT id FROM authors", &[]).await.unwrap();

    let err = handle.force().await.unwrap_err();
    assert!(err.downcast_ref::<PreparedStatementCacheExpired>().is_some());

    tx.rollback().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn dropped_transaction_guard_owes_a_rollback() {
    let (adapter, mut backend) = connect_default().await;

    let server = tokio::spawn(async move {
        let (tag, body) = backend.recv().await;
        assert_eq!(tag, b'Q');
        assert_eq!(query_text(&body), "BEGIN");
        backend.send(&[command_complete("BEGIN"), ready(b'T')]).await;

        // the debt is settled before the next statement runs
        let (tag, body) = backend.recv().await;
        assert_eq!(tag, b'Q');
        assert_eq!(query_text(&body), "ROLLBACK");
        backend.send(&[command_complete("ROLLBACK"), ready(b'I')]).await;

        let (tag, body) = backend.recv().await;
        assert_eq!(tag, b'Q');
        assert_eq!(query_text(&body), "SELECT 1");
        backend.send(&[command_complete("SELECT 1"), ready(b'I')]).await;
    });

    {
        let _tx = adapter.begin().await.unwrap();
        // dropped without commit or rollback
    }

    adapter.execute("SELECT 1", "SQL").await.unwrap();

    server.await.unwrap();
}

#[tokio::test]
async fn check_in_leaves_connection_reusable() {
    let (client_io, server_io) = tokio::io::duplex(1 << 20);

    let pool = Pool::builder("user=tester dbname=app")
        .connector(TestConnector::new(vec![client_io]))
        .build()
        .unwrap();

    let server = tokio::spawn(async move {
        let mut backend = MockBackend::new(server_io);
        backend.handshake().await;

        for n in [1, 2] {
            backend.recv_until_sync().await;
            backend
                .send(&[
                    parse_complete(),
                    bind_complete(),
                    parameter_description(&[]),
                    row_description(&[("n", 23)]),
                    data_row(&[Some(&int4(n))]),
                    command_complete("SELECT 1"),
                    ready(b'I'),
                ])
                .await;
        }

        // the statement issued by the second checkout
        let (tag, body) = backend.recv().await;
        assert_eq!(tag, b'Q');
        assert_eq!(query_text(&body), "SELECT 1");
        backend.send(&[command_complete("SELECT 1"), ready(b'I')]).await;
    });

    {
        let conn = pool.get().await.unwrap();
        // two in-flight handles are abandoned without being forced
        conn.exec_query("SELECT 1", "SQL", &[], false).await.unwrap();
        conn.exec_query("SELECT 2", "SQL", &[], false).await.unwrap();
        assert_eq!(conn.pending().await, 2);
        conn.release().await;
    }

    // the same connection comes back with an empty queue and works
    let conn = pool.get().await.unwrap();
    assert_eq!(conn.pending().await, 0);
    assert_eq!(conn.execute("SELECT 1", "SQL").await.unwrap(), 1);

    server.await.unwrap();
}

#[tokio::test]
async fn disabled_pipeline_resolves_handles_at_issue_time() {
    let (adapter, mut backend) = connect("user=tester dbname=app pipeline=off").await;

    let server = tokio::spawn(async move {
        backend.recv_until_sync().await;
        backend
            .send(&[
                parse_complete(),
                bind_complete(),
                parameter_description(&[]),
                row_description(&[("id", 23)]),
                data_row(&[Some(&int4(9))]),
                command_complete("SELECT 1"),
                ready(b'I'),
            ])
            .await;
    });

    let handle = adapter
        .exec_query("SELECT id FROM users", "User Load", &[], false)
        .await
        .unwrap();

    assert!(!handle.is_scheduled());
    assert!(handle.is_resolved());
    assert_eq!(handle.first().await.unwrap().unwrap().get::<i32>(0), 9);

    server.await.unwrap();
}

#[tokio::test]
async fn select_value_forces_the_first_value() {
    let (adapter, mut backend) = connect_default().await;

    let server = tokio::spawn(async move {
        backend.recv_until_sync().await;
        backend
            .send(&[
                parse_complete(),
                parameter_description(&[]),
                row_description(&[("count", 23)]),
                ready(b'I'),
            ])
            .await;

        backend.recv_until_sync().await;
        backend
            .send(&[
                bind_complete(),
                data_row(&[Some(&int4(42))]),
                command_complete("SELECT 1"),
                ready(b'I'),
            ])
            .await;
    });

    let count = adapter
        .select_value::<i32>("SELECT count(*) FROM users", &[])
        .await
        .unwrap();
    assert_eq!(count, Some(42));

    server.await.unwrap();
}

#[tokio::test]
async fn disconnect_is_terminal_until_reconnect() {
    let (client1, server1) = tokio::io::duplex(1 << 20);
    let (client2, server2) = tokio::io::duplex(1 << 20);

    let connect_fut = postgres_pipeline::Adapter::builder("user=tester dbname=app")
        .connector(TestConnector::new(vec![client1, client2]))
        .connect();
    let handshake = async {
        let mut backend = MockBackend::new(server1);
        backend.handshake().await;
        backend
    };
    let (adapter, backend1) = tokio::join!(connect_fut, handshake);
    let adapter = adapter.unwrap();

    adapter.disconnect().await;
    assert!(adapter.closed().await);
    assert!(!adapter.active().await);
    assert!(adapter.execute("SELECT 1", "SQL").await.is_err());

    let server2_task = tokio::spawn(async move {
        let mut backend = MockBackend::new(server2);
        backend.handshake().await;

        let (tag, _) = backend.recv().await;
        assert_eq!(tag, b'Q');
        backend.send(&[command_complete("SELECT 1"), ready(b'I')]).await;
    });

    adapter.reconnect().await.unwrap();
    assert!(adapter.active().await);

    drop(backend1);
    server2_task.await.unwrap();
}
