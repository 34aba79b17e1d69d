//! Diffusers-style conversion against host module paths

use candle_core::{DType, Device, Tensor};
use lora_rekey::{
    converter_for, ConversionConfig, ConversionStrategy, DiffusersConverter, LoraConverter,
    WeightDict, WeightMerger,
};
use test_case::test_case;

use crate::fixtures::{assert_close, flat, z_image_adapter, z_image_base, GroupSpec};
use crate::init_test_logging;

fn diffusers_config() -> ConversionConfig {
    ConversionConfig {
        strategy: ConversionStrategy::Diffusers,
        ..Default::default()
    }
}

#[test_case("lora_unet_layers_7_attention_to_q", "layers.7.attention.to_q" ; "z-image attention")]
#[test_case("lora_unet_noise_refiner_1_feed_forward_w3", "noise_refiner.1.feed_forward.w3")]
#[test_case("lora_unet_blocks_12_self_attn_o", "blocks.12.self_attn.o" ; "wan self attention")]
#[test_case("lora_unet_blocks_0_cross_attn_norm_q", "blocks.0.cross_attn.norm_q" ; "wan norm")]
#[test_case("lora_unet_double_blocks_3_txt_mod_lin", "double_blocks.3.txt_mod.lin" ; "dual stream")]
#[test_case("lora_unet_final_layer_adaLN_modulation_1", "final_layer.adaLN_modulation.1" ; "final")]
#[test_case("lora_unet_foo_bar_1", "foo.bar.1" ; "unknown family")]
fn test_module_path_resolution(group: &str, module: &str) {
    let mut dict = WeightDict::new();
    GroupSpec::new(group, 2, 8, 8).insert_into(&mut dict);

    let converted = converter_for(&diffusers_config()).unwrap().convert(&dict).unwrap();
    let mut expected = vec![
        format!("diffusion_model.{module}.lora_A.weight"),
        format!("diffusion_model.{module}.lora_B.weight"),
    ];
    expected.sort();
    assert_eq!(converted.weights.keys(), expected);
}

#[test]
fn test_missing_alpha_keeps_weights() {
    init_test_logging();
    let mut dict = WeightDict::new();
    GroupSpec::new("lora_unet_layers_0_feed_forward_w1", 4, 8, 8)
        .alpha(None)
        .insert_into(&mut dict);

    let converted = DiffusersConverter::from_config(&diffusers_config())
        .convert(&dict)
        .unwrap();

    let up = converted
        .weights
        .get("diffusion_model.layers.0.feed_forward.w1.lora_B.weight")
        .unwrap();
    let source = dict.get("lora_unet_layers_0_feed_forward_w1.lora_up.weight").unwrap();
    assert_eq!(flat(up), flat(source));
    assert_eq!(converted.report.unscaled_groups.len(), 1);
}

#[test]
fn test_scaling_preserves_effective_delta() {
    let (rank, alpha) = (8usize, 2f32);
    let mut dict = WeightDict::new();
    GroupSpec::new("lora_unet_x_embedder", rank, 12, 6)
        .alpha(Some(alpha))
        .insert_into(&mut dict);

    let converted = DiffusersConverter::from_config(&diffusers_config())
        .convert(&dict)
        .unwrap();

    let down = converted.weights.get("diffusion_model.x_embedder.lora_A.weight").unwrap();
    let up = converted.weights.get("diffusion_model.x_embedder.lora_B.weight").unwrap();
    let source_down = dict.get("lora_unet_x_embedder.lora_down.weight").unwrap();
    let source_up = dict.get("lora_unet_x_embedder.lora_up.weight").unwrap();

    let expected = source_up
        .matmul(source_down)
        .unwrap()
        .affine(alpha as f64 / rank as f64, 0.0)
        .unwrap();
    assert_close(&up.matmul(down).unwrap(), &expected);
}

#[test]
fn test_converted_keys_resolve_against_host_model() {
    init_test_logging();
    let device = Device::Cpu;
    let mut dict = WeightDict::new();
    GroupSpec::new("lora_unet_blocks_0_self_attn_q", 4, 8, 8).insert_into(&mut dict);
    GroupSpec::new("lora_unet_blocks_0_ffn_0", 4, 8, 32).insert_into(&mut dict);
    GroupSpec::new("lora_unet_single_blocks_1_linear2", 4, 40, 8).insert_into(&mut dict);

    let mut base = WeightDict::new();
    for (key, shape) in [
        ("diffusion_model.blocks.0.self_attn.q.weight", (8, 8)),
        ("diffusion_model.blocks.0.ffn.0.weight", (32, 8)),
        ("diffusion_model.single_blocks.1.linear2.weight", (8, 40)),
    ] {
        base.insert(key, Tensor::zeros(shape, DType::F32, &device).unwrap());
    }

    let converted = DiffusersConverter::from_config(&diffusers_config())
        .convert(&dict)
        .unwrap();
    let (merged, plan) = WeightMerger::default()
        .merge(&base, &converted.weights, 1.0)
        .unwrap();

    assert!(plan.is_complete(), "unresolved: {:?}", plan.unresolved);
    assert_eq!(plan.targets.len(), 3);

    // Alpha is folded in, so the merged delta carries alpha / rank.
    let source_up = dict.get("lora_unet_blocks_0_ffn_0.lora_up.weight").unwrap();
    let source_down = dict.get("lora_unet_blocks_0_ffn_0.lora_down.weight").unwrap();
    let expected = source_up.matmul(source_down).unwrap().affine(0.5, 0.0).unwrap();
    assert_close(merged.get("diffusion_model.blocks.0.ffn.0.weight").unwrap(), &expected);
}

#[test]
fn test_fuse_qkv_option_targets_fused_projection() {
    let width = 16;
    let mut config = diffusers_config();
    config.fuse_qkv = true;

    let dict = z_image_adapter(2, 4, width);
    let converted = converter_for(&config).unwrap().convert(&dict).unwrap();
    assert_eq!(converted.report.fused, 1);

    let mut base = z_image_base(2, width);
    base.insert(
        "diffusion_model.layers.2.attention.to_out.0.weight",
        Tensor::zeros((width, width), DType::F32, &Device::Cpu).unwrap(),
    );
    let plan = WeightMerger::default().plan(&base, &converted.weights).unwrap();
    assert!(plan.is_complete(), "unresolved: {:?}", plan.unresolved);

    let mut resolved: Vec<_> = plan.targets.iter().map(|t| t.base_key.as_str()).collect();
    resolved.sort();
    assert_eq!(
        resolved,
        vec![
            "diffusion_model.layers.2.attention.qkv.weight",
            "diffusion_model.layers.2.attention.to_out.0.weight",
        ]
    );
}
