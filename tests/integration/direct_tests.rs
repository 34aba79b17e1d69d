//! Direct-rename conversion from file to merged base weights

use candle_core::{Device, Tensor};
use lora_rekey::lora::{fuse_qkv, LoraPair};
use lora_rekey::weights::scalar_value;
use lora_rekey::{
    converter_for, ConversionConfig, LoraConverter, LoraLoader, PatchedModel, SafetensorsDirectory,
    WeightDict, WeightMerger,
};
use proptest::prelude::*;

use crate::fixtures::{adapter_dir, assert_close, z_image_adapter, z_image_base, GroupSpec};
use crate::init_test_logging;

fn convert(dict: &WeightDict) -> lora_rekey::Converted {
    converter_for(&ConversionConfig::default())
        .unwrap()
        .convert(dict)
        .unwrap()
}

#[test]
fn test_output_projection_rename() {
    init_test_logging();
    let mut dict = WeightDict::new();
    GroupSpec::new("block.layers.attention_to_out_0", 2, 8, 8).insert_into(&mut dict);

    let converted = convert(&dict);
    assert_eq!(converted.report.renamed, 3);
    assert!(converted.weights.contains_key("block.layers.attention_out.lora_down.weight"));
    assert!(converted.weights.contains_key("block.layers.attention_out.alpha"));
}

#[test]
fn test_single_key_rename_counts_one() {
    let device = Device::Cpu;
    let mut dict = WeightDict::new();
    dict.insert(
        "block.layers.attention_to_out_0.lora_down.weight",
        Tensor::randn(0f32, 1f32, (2, 8), &device).unwrap(),
    );

    let converted = convert(&dict);
    assert_eq!(converted.report.renamed, 1);
    assert_eq!(
        converted.weights.keys(),
        vec!["block.layers.attention_out.lora_down.weight".to_string()]
    );
}

#[test]
fn test_z_image_qkv_fusion_shapes() {
    init_test_logging();
    let mut dict = WeightDict::new();
    for member in ["to_q", "to_k", "to_v"] {
        GroupSpec::new(&format!("lora_unet_layers_0_attention_{member}"), 8, 64, 64)
            .alpha(Some(4.0))
            .insert_into(&mut dict);
    }

    let converted = convert(&dict);
    let weights = &converted.weights;

    // Six factors and three alphas become exactly three tensors.
    assert_eq!(weights.len(), 3);
    assert_eq!(converted.report.fused, 1);
    assert_eq!(
        weights.get("lora_unet_layers_0_attention_qkv.lora_down.weight").unwrap().dims(),
        &[24, 64]
    );
    assert_eq!(
        weights.get("lora_unet_layers_0_attention_qkv.lora_up.weight").unwrap().dims(),
        &[192, 24]
    );
    let alpha = weights.get("lora_unet_layers_0_attention_qkv.alpha").unwrap();
    assert_eq!(scalar_value(alpha).unwrap(), 12.0);
}

#[test]
fn test_fused_product_matches_separate_products() {
    let dict = z_image_adapter(3, 4, 16);
    let converted = convert(&dict);
    let weights = &converted.weights;

    let product = |group: &str, dict: &WeightDict| {
        let up = dict.get(&format!("{group}.lora_up.weight")).unwrap();
        let down = dict.get(&format!("{group}.lora_down.weight")).unwrap();
        up.matmul(down).unwrap()
    };
    let expected = Tensor::cat(
        &[
            product("lora_unet_layers_3_attention_to_q", &dict),
            product("lora_unet_layers_3_attention_to_k", &dict),
            product("lora_unet_layers_3_attention_to_v", &dict),
        ],
        0,
    )
    .unwrap();

    assert_close(&product("lora_unet_layers_3_attention_qkv", weights), &expected);
}

#[test]
fn test_hunyuan_double_block_conversion() {
    let mut dict = WeightDict::new();
    for stream in ["img", "txt"] {
        for member in ["q", "k", "v"] {
            GroupSpec::new(&format!("lora_unet_double_blocks_0_{stream}_attn_{member}"), 2, 8, 8)
                .insert_into(&mut dict);
        }
        GroupSpec::new(&format!("lora_unet_double_blocks_0_{stream}_mod_linear"), 2, 8, 48)
            .insert_into(&mut dict);
    }

    let converted = convert(&dict);
    let mut keys = converted.weights.keys();
    keys.sort();

    assert_eq!(converted.report.fused, 2);
    assert_eq!(
        keys,
        vec![
            "lora_unet_double_blocks_0_img_attn_qkv.alpha",
            "lora_unet_double_blocks_0_img_attn_qkv.lora_down.weight",
            "lora_unet_double_blocks_0_img_attn_qkv.lora_up.weight",
            "lora_unet_double_blocks_0_img_mod_lin.alpha",
            "lora_unet_double_blocks_0_img_mod_lin.lora_down.weight",
            "lora_unet_double_blocks_0_img_mod_lin.lora_up.weight",
            "lora_unet_double_blocks_0_txt_attn_qkv.alpha",
            "lora_unet_double_blocks_0_txt_attn_qkv.lora_down.weight",
            "lora_unet_double_blocks_0_txt_attn_qkv.lora_up.weight",
            "lora_unet_double_blocks_0_txt_mod_lin.alpha",
            "lora_unet_double_blocks_0_txt_mod_lin.lora_down.weight",
            "lora_unet_double_blocks_0_txt_mod_lin.lora_up.weight",
        ]
    );
}

#[test]
fn test_converted_adapter_merges_into_base() {
    init_test_logging();
    let (rank, width, strength) = (4, 16, 0.75);
    let dict = z_image_adapter(0, rank, width);
    let dir = adapter_dir("z_image.safetensors", &dict);

    let source = SafetensorsDirectory::new(dir.path(), Device::Cpu);
    let loader = LoraLoader::from_config(source, &ConversionConfig::default()).unwrap();
    let merger = WeightMerger::default();

    let patched = loader
        .load(&merger, PatchedModel::from(z_image_base(0, width)), "z_image.safetensors", strength)
        .unwrap();
    assert!(patched.applied.is_complete());
    assert_eq!(patched.applied.targets.len(), 2);

    // fused alpha / fused rank == 4 / rank
    let scale = strength * 4.0 / rank as f64;
    let pairs: Vec<LoraPair> = ["to_q", "to_k", "to_v"]
        .iter()
        .map(|member| {
            let group = format!("lora_unet_layers_0_attention_{member}");
            LoraPair::new(
                dict.get(&format!("{group}.lora_down.weight")).unwrap().clone(),
                dict.get(&format!("{group}.lora_up.weight")).unwrap().clone(),
            )
        })
        .collect();
    let [q, k, v]: [LoraPair; 3] = pairs.try_into().unwrap();
    let fused = fuse_qkv(q, k, v, None).unwrap();
    let expected = fused.up.matmul(&fused.down).unwrap().affine(scale, 0.0).unwrap();

    let qkv = patched
        .weights
        .get("diffusion_model.layers.0.attention.qkv.weight")
        .unwrap();
    assert_close(qkv, &expected);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn test_fusion_equivalence_for_any_rank(
        rank in 1usize..5,
        width in 1usize..7,
        input in 1usize..7,
    ) {
        let device = Device::Cpu;
        let pair = || LoraPair::new(
            Tensor::randn(0f32, 1f32, (rank, input), &device).unwrap(),
            Tensor::randn(0f32, 1f32, (width, rank), &device).unwrap(),
        );
        let (q, k, v) = (pair(), pair(), pair());
        let expected = Tensor::cat(
            &[
                q.up.matmul(&q.down).unwrap(),
                k.up.matmul(&k.down).unwrap(),
                v.up.matmul(&v.down).unwrap(),
            ],
            0,
        )
        .unwrap();

        let fused = fuse_qkv(q, k, v, None).unwrap();
        prop_assert_eq!(fused.down.dims(), &[3 * rank, input]);
        assert_close(&fused.up.matmul(&fused.down).unwrap(), &expected);
    }
}
