//! Exercises spec.md §8 Scenario 1 ("Hello world") end to end without
//! spawning real processes: a client frame is routed to a group, handed
//! to an idle worker by the dispatcher, run through the same handler
//! `main.rs` registers, and the response is matched back to the
//! originating client connection.

use relayd_core::dispatcher::{Assignment, Dispatcher};
use relayd_core::{Request, Task, TaskContainer};
use relayd_protocol::BoxFrame;

fn group_router(_frame: &BoxFrame) -> u32 {
    1
}

fn stamp_ret_10(req: &Request<BoxFrame>) -> Result<BoxFrame, String> {
    Ok(req.frame().with_ret(10))
}

#[test]
fn client_frame_round_trips_through_dispatcher_and_handler() {
    let mut dispatcher: Dispatcher<BoxFrame> = Dispatcher::new();

    let client_conn_id = 1u64;
    let worker_id = 100u64;

    let client_frame = BoxFrame::request(1, b"ping".to_vec());
    let group_id = group_router(&client_frame);
    assert_eq!(group_id, 1);

    dispatcher.register_worker(worker_id, group_id);

    let task: Task<BoxFrame> = Task::new(0x7f000001, client_frame.encode());
    let container = TaskContainer::new(task, client_conn_id);

    let assignment = dispatcher.add_task(group_id, container);
    let (assigned_worker, container) = match assignment {
        Assignment::ToWorker { worker_id, task } => (worker_id, task),
        _ => panic!("expected immediate assignment to the idle worker"),
    };
    assert_eq!(assigned_worker, worker_id);
    dispatcher.mark_in_flight(assigned_worker, container);

    // What the worker process does with the assigned task: parse the
    // client's frame back out and run the registered handler.
    let req = Request::new(&client_frame, 0x7f000001);
    let response = stamp_ret_10(&req).unwrap();
    assert_eq!(response.ret(), 10);
    assert_eq!(response.body(), b"ping");

    // The proxy matches the response back to the client that sent it.
    let in_flight = dispatcher.take_response(assigned_worker).unwrap();
    assert_eq!(in_flight.container.client_conn_id, client_conn_id);
}
