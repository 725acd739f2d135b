//! End-to-end scenarios across recording, binding and submission

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::DeviceConfig;
use crate::descriptor::ShaderResourceView;
use crate::descriptor_cache::ViewHeapStrategy;
use crate::foundation::logging;
use crate::hal::{
    AddressMode, DescriptorHeapType, FilterMode, NativeDevice, NullDevice, QueueType, RawResource, ResourceDesc,
    SamplerDesc, ShaderStage,
};
use crate::state::{Resource, ResourceStates, Subresources};
use crate::{DeviceContext, GpuError};

fn setup(device: NullDevice, config: DeviceConfig) -> (Arc<NullDevice>, Arc<DeviceContext>) {
    logging::init_for_tests();
    let device = Arc::new(device);
    let context = DeviceContext::new(Arc::clone(&device) as Arc<dyn NativeDevice>, config).unwrap();
    (device, context)
}

fn texture_view(context: &DeviceContext) -> (Arc<Resource>, ShaderResourceView) {
    let texture = context
        .create_resource(ResourceDesc::texture_2d(64, 64, 1, 1), ResourceStates::PIXEL_SHADER_RESOURCE)
        .unwrap();
    let view = context.create_shader_resource_view(&texture).unwrap();
    (texture, view)
}

#[test]
fn test_sequential_reservations_on_fresh_heap() {
    let (_device, context) = setup(NullDevice::new(), DeviceConfig::new().with_sub_allocation(1024, 256));
    let mut commands = context.create_command_context(QueueType::Direct).unwrap();

    assert_eq!(commands.reserve_descriptors(DescriptorHeapType::View, 10).unwrap(), 0);
    assert_eq!(commands.reserve_descriptors(DescriptorHeapType::View, 10).unwrap(), 10);
}

#[test]
fn test_concurrent_lists_insert_one_barrier() {
    let (device, context) = setup(NullDevice::new(), DeviceConfig::default());
    let shared = Arc::new(Resource::new(
        RawResource(7000),
        ResourceDesc::texture_2d(32, 32, 1, 1),
        ResourceStates::COMMON,
    ));

    let mut first = context.create_command_context(QueueType::Direct).unwrap();
    let mut second = context.create_command_context(QueueType::Direct).unwrap();
    first
        .transition_resource(&shared, ResourceStates::RENDER_TARGET, Subresources::All)
        .unwrap();
    second
        .transition_resource(&shared, ResourceStates::RENDER_TARGET, Subresources::All)
        .unwrap();
    first.draw(3, 1).unwrap();
    second.draw(3, 1).unwrap();

    let lists = vec![
        first.take_closed_list().unwrap().unwrap(),
        second.take_closed_list().unwrap().unwrap(),
    ];
    let queue = context.queue(QueueType::Direct);
    queue.execute(lists, false).unwrap();

    let barriers = device.executed_barriers(queue.raw());
    assert_eq!(barriers.len(), 1);
    assert_eq!(barriers[0].before, ResourceStates::COMMON);
    assert_eq!(barriers[0].after, ResourceStates::RENDER_TARGET);
    assert_eq!(shared.authoritative_state(0).known(), Some(ResourceStates::RENDER_TARGET));
}

#[test]
fn test_close_and_submit_blocks_until_complete() {
    let (device, context) = setup(NullDevice::deferred(), DeviceConfig::default());
    let mut commands = context.create_command_context(QueueType::Direct).unwrap();
    commands.draw(3, 1).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let completer = {
        let device = Arc::clone(&device);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            while !done.load(Ordering::Acquire) {
                device.complete_all();
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    let sync_point = commands.close_and_submit(true).unwrap();
    assert!(context.is_sync_point_complete(&sync_point));
    assert_eq!(commands.last_sync_point(), Some(&sync_point));

    done.store(true, Ordering::Release);
    completer.join().unwrap();
}

#[test]
fn test_identical_shader_resource_bind_copies_nothing() {
    let (device, context) = setup(NullDevice::new(), DeviceConfig::default());
    let mut commands = context.create_command_context(QueueType::Direct).unwrap();
    let (_first, first_view) = texture_view(&context);
    let (_second, second_view) = texture_view(&context);

    commands.set_shader_resources(ShaderStage::Pixel, 0, &[Some(first_view), None, Some(second_view)]);
    commands.bind_shader_resources(ShaderStage::Pixel, 3).unwrap();
    commands.draw(3, 1).unwrap();

    device.reset_stats();
    commands.bind_shader_resources(ShaderStage::Pixel, 3).unwrap();
    commands.draw(3, 1).unwrap();

    assert_eq!(device.stats().copy_calls, 0);
    let stats = commands.descriptor_cache().unwrap().stats();
    assert_eq!((stats.srv_hits, stats.srv_misses), (1, 1));
}

#[test]
fn test_renamed_view_copies_only_changed_entry() {
    let (device, context) = setup(NullDevice::new(), DeviceConfig::default());
    let mut commands = context.create_command_context(QueueType::Direct).unwrap();
    let views: Vec<_> = (0..4).map(|_| texture_view(&context)).collect();
    let slots: Vec<_> = views.iter().map(|(_, view)| Some(view.clone())).collect();

    commands.set_shader_resources(ShaderStage::Pixel, 0, &slots);
    commands.bind_shader_resources(ShaderStage::Pixel, 4).unwrap();

    let (replacement, _) = texture_view(&context);
    context.rename_shader_resource_view(&views[2].1, replacement);
    device.reset_stats();
    commands.bind_shader_resources(ShaderStage::Pixel, 4).unwrap();

    // One staging update plus one copy of the whole table
    assert_eq!(device.stats().copy_calls, 2);
    assert_eq!(device.stats().descriptors_copied, 1 + 4);
}

#[test]
fn test_full_heap_rolls_over_and_misses() {
    let config = DeviceConfig::new().with_sub_allocation(64, 16);
    let (_device, context) = setup(NullDevice::new(), config);
    let mut commands = context.create_command_context(QueueType::Direct).unwrap();
    let (_texture, view) = texture_view(&context);
    let (_other, other_view) = texture_view(&context);
    let full_table = vec![Some(view); 16];

    commands.set_shader_resources(ShaderStage::Pixel, 0, &full_table);
    commands.bind_shader_resources(ShaderStage::Pixel, 16).unwrap();
    assert_eq!(commands.descriptor_cache().unwrap().descriptor_generation(DescriptorHeapType::View), 0);

    commands.set_shader_resources(ShaderStage::Pixel, 0, &[Some(other_view)]);
    commands.bind_shader_resources(ShaderStage::Pixel, 16).unwrap();
    let cache = commands.descriptor_cache().unwrap();
    assert_eq!(cache.descriptor_generation(DescriptorHeapType::View), 1);
    assert_eq!(cache.view_heap_strategy(), ViewHeapStrategy::SubAllocated);

    commands.set_shader_resources(ShaderStage::Pixel, 0, &full_table);
    commands.bind_shader_resources(ShaderStage::Pixel, 16).unwrap();
    let stats = commands.descriptor_cache().unwrap().stats();
    assert_eq!((stats.srv_hits, stats.srv_misses), (0, 3));
}

#[test]
fn test_block_starvation_falls_back_permanently() {
    let config = DeviceConfig::new().with_sub_allocation(32, 16);
    let (device, context) = setup(NullDevice::deferred(), config);
    let mut first = context.create_command_context(QueueType::Direct).unwrap();
    let _second = context.create_command_context(QueueType::Compute).unwrap();
    assert_eq!(context.sub_allocation_pool().free_block_count(), 0);

    first.reserve_descriptors(DescriptorHeapType::View, 16).unwrap();
    first.reserve_descriptors(DescriptorHeapType::View, 1).unwrap();
    let cache = first.descriptor_cache().unwrap();
    assert_eq!(cache.view_heap_strategy(), ViewHeapStrategy::ThreadLocal);

    // The released block stays busy until the list that used it completes
    first.close_and_submit(false).unwrap();
    let late = context.create_command_context(QueueType::Direct).unwrap();
    assert_eq!(
        late.descriptor_cache().unwrap().view_heap_strategy(),
        ViewHeapStrategy::ThreadLocal
    );

    device.complete_all();
    let recovered = context.create_command_context(QueueType::Direct).unwrap();
    assert_eq!(
        recovered.descriptor_cache().unwrap().view_heap_strategy(),
        ViewHeapStrategy::SubAllocated
    );

    first.reserve_descriptors(DescriptorHeapType::View, 1).unwrap();
    assert_eq!(
        first.descriptor_cache().unwrap().view_heap_strategy(),
        ViewHeapStrategy::ThreadLocal
    );
}

#[test]
fn test_sampler_tables_shared_across_contexts() {
    let (device, context) = setup(NullDevice::new(), DeviceConfig::default());
    let clamp = context
        .create_sampler(SamplerDesc {
            filter: FilterMode::Point,
            address_mode: AddressMode::Clamp,
            max_anisotropy: 1,
        })
        .unwrap();

    let mut first = context.create_command_context(QueueType::Direct).unwrap();
    let mut second = context.create_command_context(QueueType::Direct).unwrap();
    for commands in [&mut first, &mut second] {
        commands.set_samplers(ShaderStage::Pixel, 0, &[Some(clamp.clone()), None]);
    }

    first.bind_samplers(ShaderStage::Pixel, 2).unwrap();
    assert_eq!(first.end_frame(), 1);
    assert_eq!(context.global_sampler_heap().lock().table_count(), 1);

    // The second context picks the merged table up at its next frame boundary
    assert_eq!(second.end_frame(), 0);
    device.reset_stats();
    second.bind_samplers(ShaderStage::Pixel, 2).unwrap();

    assert_eq!(device.stats().copy_calls, 0);
    let cache = second.descriptor_cache().unwrap();
    assert!(cache.is_using_global_samplers());
    assert_eq!(cache.stats().global_sampler_hits, 1);
}

#[test]
fn test_device_loss_is_sticky() {
    let (device, context) = setup(NullDevice::new(), DeviceConfig::default());
    let mut commands = context.create_command_context(QueueType::Direct).unwrap();
    commands.draw(3, 1).unwrap();
    let sync_point = {
        let mut probe = context.create_command_context(QueueType::Direct).unwrap();
        probe.draw(1, 1).unwrap();
        probe.close_and_submit(false).unwrap()
    };

    device.lose_device();
    assert!(matches!(commands.close_and_submit(false), Err(GpuError::DeviceLost)));
    assert!(context.is_device_lost());
    assert!(matches!(commands.draw(3, 1), Err(GpuError::DeviceLost)));
    assert!(matches!(context.wait_for_sync_point(&sync_point), Err(GpuError::DeviceLost)));
}
