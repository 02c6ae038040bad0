//! Subcommand handlers.

use crate::Context;
use guider_common::consts::{DEFAULT_OPTION_MAX, DEFAULT_OPTION_MIN, INVALID_INDEX};
use guider_common::shm::layout::{CameraListShm, MountListShm, RegistryLayout};
use guider_common::shm::names::{EquipmentClass, ShmNames};
use guider_shm::{
    CameraAccess, CameraRegistry, ChangeEvent, ChangeSource, EventMonitor, InstanceChanges,
    ListChanges, MonitorHandle, MountRegistry, OptionChanges, OptionTable, PollingMonitor,
    RegistryAccess, RegistryManager, RegistryReader, RegistrySnapshot, RequestChanges,
    SelectionChanges, ShmResult,
};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;
use tracing::{info, warn};

type CliResult = Result<(), Box<dyn std::error::Error>>;

const TICK: Duration = Duration::from_millis(200);

fn print_json<T: Serialize + ?Sized>(value: &T) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn index_text(index: u32) -> String {
    if index == INVALID_INDEX {
        "none".to_string()
    } else {
        index.to_string()
    }
}

fn shutdown_flag() -> Result<Arc<AtomicBool>, ctrlc::Error> {
    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        info!("received shutdown signal");
        flag.store(false, Ordering::SeqCst);
    })?;
    Ok(running)
}

fn snapshot_of<L: RegistryLayout>(names: &ShmNames) -> ShmResult<RegistrySnapshot> {
    RegistryReader::<L>::attach(names)?.snapshot()
}

fn class_snapshot(ctx: &Context) -> ShmResult<RegistrySnapshot> {
    match ctx.class {
        EquipmentClass::Camera => snapshot_of::<CameraListShm>(&ctx.names),
        EquipmentClass::Mount => snapshot_of::<MountListShm>(&ctx.names),
    }
}

/// `list`
pub fn list(ctx: &Context) -> CliResult {
    let snapshot = class_snapshot(ctx)?;
    if ctx.json {
        return print_json(&snapshot);
    }
    if snapshot.items.is_empty() {
        println!("no {} published", snapshot.class);
    }
    for (i, item) in snapshot.items.iter().enumerate() {
        let marker = if snapshot.selected() == Some(i) { '*' } else { ' ' };
        println!("{marker} {i:>2}  {item}");
    }
    Ok(())
}

/// `selected`
pub fn selected(ctx: &Context) -> CliResult {
    let snapshot = class_snapshot(ctx)?;
    if ctx.json {
        return print_json(&serde_json::json!({
            "class": snapshot.class,
            "selected_index": snapshot.selected(),
            "name": snapshot.selected_name(),
            "selection_version": snapshot.selection_version,
        }));
    }
    match snapshot.selected_name() {
        Some(name) => println!("{} {}", index_text(snapshot.selected_index), name),
        None => println!("none"),
    }
    Ok(())
}

fn select_in<L: RegistryLayout>(names: &ShmNames, index: u32) -> ShmResult<bool> {
    let registry = RegistryManager::<L>::attach(names, false)?;
    let changed = registry.set_selected(index)?;
    registry.shutdown(false)?;
    Ok(changed)
}

/// `select` and `deselect`
pub fn select(ctx: &Context, index: u32) -> CliResult {
    let changed = match ctx.class {
        EquipmentClass::Camera => select_in::<CameraListShm>(&ctx.names, index)?,
        EquipmentClass::Mount => select_in::<MountListShm>(&ctx.names, index)?,
    };
    if ctx.json {
        return print_json(&serde_json::json!({ "index": index_text(index), "changed": changed }));
    }
    if changed {
        println!("{} selection set to {}", ctx.class, index_text(index));
    } else {
        println!("{} selection already {}", ctx.class, index_text(index));
    }
    Ok(())
}

fn request_in<L: RegistryLayout>(names: &ShmNames, index: u32) -> ShmResult<u32> {
    let registry = RegistryManager::<L>::attach(names, false)?;
    registry.request_selection(index)?;
    let version = registry.request_version()?;
    registry.shutdown(false)?;
    Ok(version)
}

/// `request`
pub fn request(ctx: &Context, index: u32) -> CliResult {
    let version = match ctx.class {
        EquipmentClass::Camera => request_in::<CameraListShm>(&ctx.names, index)?,
        EquipmentClass::Mount => request_in::<MountListShm>(&ctx.names, index)?,
    };
    if ctx.json {
        return print_json(&serde_json::json!({ "requested": index_text(index), "request_version": version }));
    }
    println!("requested {} {} (request {version})", ctx.class, index_text(index));
    Ok(())
}

/// `instances`
pub fn instances(ctx: &Context) -> CliResult {
    let reader = RegistryReader::<CameraListShm>::attach(&ctx.names)?;
    let selected_id = reader.selected_instance_id()?;
    let supported = reader.instance_selection_supported()?;
    let instances = reader.instances()?;

    if ctx.json {
        return print_json(&serde_json::json!({
            "selection_supported": supported,
            "selected_id": selected_id,
            "instance_version": reader.instance_version()?,
            "instances": instances,
        }));
    }
    if !supported {
        println!("selected camera does not support instance selection");
    }
    for instance in &instances {
        let marker = if instance.id == selected_id { '*' } else { ' ' };
        println!("{marker} {:<24} {}", instance.id, instance.display_name);
    }
    Ok(())
}

/// `options`
pub fn options(ctx: &Context) -> CliResult {
    let table = OptionTable::attach_readonly(&ctx.names)?;
    let snapshot = table.snapshot()?;
    if ctx.json {
        return print_json(&snapshot);
    }
    if snapshot.is_empty() {
        println!("no options published");
    }
    for option in snapshot.iter() {
        println!(
            "{:<16} {:>8}  [{}..={}]",
            option.name, option.value, option.min, option.max
        );
    }
    Ok(())
}

/// `set-option`
pub fn set_option(ctx: &Context, name: &str, value: i32, bounds: Option<(i32, i32)>) -> CliResult {
    let table = OptionTable::attach(&ctx.names, false)?;
    let changed = match bounds {
        Some((min, max)) => table.set_with_bounds(name, value, min, max)?,
        None => table.set(name, value)?,
    };
    let version = table.update_version()?;
    table.shutdown(false)?;

    if ctx.json {
        return print_json(&serde_json::json!({
            "name": name,
            "value": value,
            "changed": changed,
            "update_version": version,
        }));
    }
    if changed {
        println!("{name} = {value}");
    } else {
        println!("{name} already {value}");
    }
    Ok(())
}

fn registry_sources<L: RegistryLayout>(names: &ShmNames) -> ShmResult<Vec<Box<dyn ChangeSource>>> {
    let reader = RegistryReader::<L>::attach(names)?;
    let sources: Vec<Box<dyn ChangeSource>> = vec![
        Box::new(ListChanges::new(reader.clone(), names)?),
        Box::new(SelectionChanges::new(reader.clone(), names)?),
        Box::new(RequestChanges::new(reader, names)?),
    ];
    Ok(sources)
}

fn describe(event: &ChangeEvent) -> String {
    match event {
        ChangeEvent::ListChanged {
            class,
            items,
            list_version,
        } => format!("{class} list #{list_version}: {}", items.join(", ")),
        ChangeEvent::SelectionChanged {
            class,
            selected_index,
            selection_version,
        } => format!(
            "{class} selected {} (#{selection_version})",
            index_text(*selected_index)
        ),
        ChangeEvent::SelectionRequested {
            class,
            requested_index,
            request_version,
        } => format!(
            "{class} selection of {} requested (#{request_version})",
            index_text(*requested_index)
        ),
        ChangeEvent::InstanceChanged {
            selected_id,
            instance_version,
        } => format!("camera instance '{selected_id}' (#{instance_version})"),
        ChangeEvent::OptionChanged {
            name,
            value,
            update_version,
        } => format!("option {name} = {value} (#{update_version})"),
        ChangeEvent::Unavailable { source, reason } => format!("{source} unavailable: {reason}"),
    }
}

/// `monitor`
pub fn monitor(ctx: &Context, poll: bool, option_names: &[String]) -> CliResult {
    let running = shutdown_flag()?;

    let mut sources = match ctx.class {
        EquipmentClass::Camera => registry_sources::<CameraListShm>(&ctx.names)?,
        EquipmentClass::Mount => registry_sources::<MountListShm>(&ctx.names)?,
    };
    if ctx.class == EquipmentClass::Camera {
        let reader = RegistryReader::<CameraListShm>::attach(&ctx.names)?;
        sources.push(Box::new(InstanceChanges::new(reader, &ctx.names)?));
    }
    if !option_names.is_empty() {
        let table = Arc::new(OptionTable::attach_readonly(&ctx.names)?);
        for name in option_names {
            sources.push(Box::new(OptionChanges::new(Arc::clone(&table), name)?));
        }
    }

    let (tx, rx) = mpsc::channel();
    let mut handles = if poll {
        vec![PollingMonitor::spawn(sources, ctx.config.shm.poll_interval(), tx)?]
    } else {
        sources
            .into_iter()
            .map(|source| EventMonitor::spawn(source, &ctx.config.shm, tx.clone()))
            .collect::<ShmResult<Vec<_>>>()?
    };
    info!(monitors = handles.len(), "watching {}", ctx.class);

    while running.load(Ordering::SeqCst) {
        match rx.recv_timeout(TICK) {
            Ok(event) if ctx.json => println!("{}", serde_json::to_string(&event)?),
            Ok(event) => println!("{}", describe(&event)),
            Err(RecvTimeoutError::Timeout) => {
                if handles.iter().all(|h| !h.is_running()) {
                    warn!("every monitor stopped");
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    for handle in &mut handles {
        handle.stop();
    }
    Ok(())
}

fn apply_requests<L: RegistryLayout>(
    registry: &Arc<RegistryManager<L>>,
    ctx: &Context,
) -> ShmResult<MonitorHandle> {
    let source = RequestChanges::new(registry.snapshot_readonly(), &ctx.names)?;
    let applier = Arc::clone(registry);
    EventMonitor::spawn(Box::new(source), &ctx.config.shm, move |event: ChangeEvent| {
        match event {
            ChangeEvent::SelectionRequested {
                class,
                requested_index,
                ..
            } => match applier.set_selected(requested_index) {
                Ok(changed) => info!(%class, requested_index, changed, "applied selection request"),
                Err(e) => warn!(%class, error = %e, "rejected selection request"),
            },
            ChangeEvent::Unavailable { source, reason } => warn!(%source, %reason, "request monitor stopped"),
            _ => {}
        }
    })
}

fn release<T>(shared: Arc<T>, shutdown: impl FnOnce(T) -> ShmResult<()>) -> ShmResult<()> {
    match Arc::try_unwrap(shared) {
        Ok(inner) => shutdown(inner),
        Err(_) => {
            warn!("handle still shared, leaving segment in place");
            Ok(())
        }
    }
}

/// `serve`
pub fn serve(
    ctx: &Context,
    cameras: &[String],
    mounts: &[String],
    options: &[(String, i32)],
    keep: bool,
) -> CliResult {
    let running = shutdown_flag()?;
    let create = ctx.config.shm.create_if_missing;

    let camera_registry = Arc::new(CameraRegistry::attach(&ctx.names, create)?);
    let mount_registry = Arc::new(MountRegistry::attach(&ctx.names, create)?);
    let table = Arc::new(OptionTable::attach(&ctx.names, create)?);
    if !camera_registry.is_owner() || !mount_registry.is_owner() {
        warn!("segments already existed; another server may own them");
    }

    camera_registry.update_list(cameras)?;
    mount_registry.update_list(mounts)?;
    for (name, value) in options {
        table.publish(name, *value, DEFAULT_OPTION_MIN, DEFAULT_OPTION_MAX)?;
    }

    let mut monitors = vec![
        apply_requests(&camera_registry, ctx)?,
        apply_requests(&mount_registry, ctx)?,
    ];
    if !options.is_empty() {
        let sources = options
            .iter()
            .map(|(name, _)| {
                OptionChanges::new(Arc::clone(&table), name)
                    .map(|source| Box::new(source) as Box<dyn ChangeSource>)
            })
            .collect::<ShmResult<Vec<_>>>()?;
        monitors.push(PollingMonitor::spawn(
            sources,
            ctx.config.shm.poll_interval(),
            |event: ChangeEvent| {
                if let ChangeEvent::OptionChanged { name, value, .. } = event {
                    info!(%name, value, "client changed option");
                }
            },
        )?);
    }

    println!(
        "serving {} cameras and {} mounts in namespace '{}', Ctrl+C to stop",
        cameras.len(),
        mounts.len(),
        ctx.names.namespace()
    );
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(TICK);
    }

    for monitor in &mut monitors {
        monitor.stop();
    }
    drop(monitors);

    let unlink = ctx.config.shm.unlink_on_shutdown && !keep;
    release(camera_registry, |registry| registry.shutdown(unlink))?;
    release(mount_registry, |registry| registry.shutdown(unlink))?;
    release(table, |table| table.shutdown(unlink))?;
    info!(unlink, "server stopped");
    Ok(())
}
