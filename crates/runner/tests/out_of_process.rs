//! End-to-end runs through the real worker binary

mod common;

use common::{config, model_dir, packed_model_dir, segment_count, worker_command};
use tensorbridge_common::{BridgeError, ExecutionErrorKind};
use tensorbridge_proto::{LoadModelArgs, TaskRequest, TaskStatus};
use tensorbridge_runner::{ExecutionFacade, FacadeState, HandleState, WorkerOptions, WorkerProcess};
use tensorbridge_worker::{DType, Tensor};

fn input() -> Tensor {
    Tensor::new("x", vec![2, 3], vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap()
}

#[test]
fn test_round_trip_under_both_ownership_rules() {
    for reader_closes_segment in [false, true] {
        let model = model_dir();
        let shm = tempfile::tempdir().unwrap();
        let config = config(shm.path(), reader_closes_segment);

        let mut facade = ExecutionFacade::out_of_process(&worker_command(), &config).unwrap();
        assert!(facade.is_out_of_process());
        assert!(facade.worker_pid().is_some());

        facade.load_model(model.path()).unwrap();
        assert_eq!(facade.state(), FacadeState::Loaded);

        // Output sized by the worker
        let mut outputs = vec![Tensor::empty("y")];
        facade.run(&[input()], &mut outputs).unwrap();
        assert_eq!(outputs[0].name(), "y");
        assert_eq!(outputs[0].shape(), &[2, 3]);
        assert_eq!(outputs[0].dtype(), Some(DType::Float32));
        assert_eq!(outputs[0].values::<f32>(), input().values::<f32>());
        assert_eq!(segment_count(shm.path()), 0);

        // Pre-shaped output slot
        let mut outputs = vec![Tensor::new("y", vec![2, 3], vec![0.0f32; 6]).unwrap()];
        facade.run(&[input()], &mut outputs).unwrap();
        assert_eq!(outputs[0].values::<f32>(), input().values::<f32>());
        assert_eq!(segment_count(shm.path()), 0);

        facade.close_model().unwrap();
        facade.close_model().unwrap();
        assert_eq!(facade.state(), FacadeState::Closed);
    }
}

#[test]
fn test_integer_tensors_cross_the_boundary() {
    let model = model_dir();
    let shm = tempfile::tempdir().unwrap();
    let mut facade = ExecutionFacade::out_of_process(&worker_command(), &config(shm.path(), false)).unwrap();
    facade.load_model(model.path()).unwrap();

    let tokens = Tensor::new("x", vec![1, 4], vec![101i64, -7, 0, i64::MAX]).unwrap();
    let mut outputs = vec![Tensor::empty("y")];
    facade.run(&[tokens.clone()], &mut outputs).unwrap();
    assert_eq!(outputs[0].values::<i64>(), tokens.values::<i64>());
    assert_eq!(outputs[0].shape(), &[1, 4]);
}

#[test]
fn test_failed_load_leaves_worker_usable() {
    let model = model_dir();
    let shm = tempfile::tempdir().unwrap();
    let mut facade = ExecutionFacade::out_of_process(&worker_command(), &config(shm.path(), false)).unwrap();

    let err = facade.load_model(shm.path().join("no-such-model")).unwrap_err();
    assert_eq!(err.execution_kind(), Some(ExecutionErrorKind::Failed));
    assert!(err.to_string().contains("Failed to load model"));
    assert!(!err.is_unrecoverable());
    assert_eq!(facade.state(), FacadeState::Unloaded);

    facade.load_model(model.path()).unwrap();
    let mut outputs = vec![Tensor::empty("y")];
    facade.run(&[input()], &mut outputs).unwrap();
    assert!(!outputs[0].is_empty());
}

#[test]
fn test_packed_model_is_unpacked_by_worker() {
    let model = packed_model_dir();
    let shm = tempfile::tempdir().unwrap();
    let mut facade = ExecutionFacade::out_of_process(&worker_command(), &config(shm.path(), false)).unwrap();

    facade.load_model(model.path()).unwrap();
    assert!(model.path().join("model.yaml").is_file());
}

#[test]
fn test_worker_failure_is_reported_and_recoverable() {
    let model = model_dir();
    let shm = tempfile::tempdir().unwrap();
    let mut facade = ExecutionFacade::out_of_process(&worker_command(), &config(shm.path(), false)).unwrap();
    facade.load_model(model.path()).unwrap();

    // The model declares one output, so the second cannot be resolved
    let mut outputs = vec![Tensor::empty("y"), Tensor::empty("z")];
    let err = facade.run(&[input()], &mut outputs).unwrap_err();
    match &err {
        BridgeError::Execution(e) => {
            assert_eq!(e.kind, ExecutionErrorKind::Failed);
            assert!(e.message().unwrap_or_default().contains("Name resolution"));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(outputs.iter().all(Tensor::is_empty));
    assert_eq!(facade.state(), FacadeState::Loaded);
    assert_eq!(segment_count(shm.path()), 0);

    let mut outputs = vec![Tensor::empty("y")];
    facade.run(&[input()], &mut outputs).unwrap();
}

#[test]
fn test_run_requires_a_loaded_model() {
    let shm = tempfile::tempdir().unwrap();
    let mut facade = ExecutionFacade::out_of_process(&worker_command(), &config(shm.path(), false)).unwrap();

    let mut outputs = vec![Tensor::empty("y")];
    let err = facade.run(&[input()], &mut outputs).unwrap_err();
    assert!(matches!(err, BridgeError::InvalidState(_)));
    assert_eq!(segment_count(shm.path()), 0);
}

#[test]
fn test_task_ids_and_sticky_status() {
    let model = model_dir();
    let shm = tempfile::tempdir().unwrap();
    let config = config(shm.path(), false);
    let mut worker = WorkerProcess::start(&worker_command(), WorkerOptions::from_config(&config)).unwrap();
    assert!(worker.is_valid());

    {
        let mut task = worker
            .submit(TaskRequest::LoadModel(LoadModelArgs {
                model_folder: model.path().to_path_buf(),
            }))
            .unwrap();
        assert_eq!(task.id(), 1);
        assert_eq!(task.command(), "LOAD_MODEL");
        assert_eq!(task.wait_for(), TaskStatus::Completed);
        assert_eq!(task.wait_for(), TaskStatus::Completed);
        assert_eq!(task.outputs(), Some(&[][..]));
        assert!(task.error().is_none());
    }

    {
        let mut task = worker
            .submit(TaskRequest::LoadModel(LoadModelArgs {
                model_folder: shm.path().join("missing"),
            }))
            .unwrap();
        assert_eq!(task.id(), 2);
        assert_eq!(task.wait_for(), TaskStatus::Failed);
        assert!(task.outputs().is_none());
        assert_eq!(task.error().map(|e| e.kind), Some(ExecutionErrorKind::Failed));
    }

    worker.close().unwrap();
    assert_eq!(worker.state(), HandleState::Closed);
    worker.close().unwrap();
    assert!(worker.submit(TaskRequest::close()).is_err());
}
