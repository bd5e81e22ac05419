mod common;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use common::{backbone_weights, phi3_config, WordTokenizer, BASE_VOCAB};
use healthgpt_core::{
    models::phi3::Model, AdapterSelector, HLoraConfig, LanguageModel, NamedParams,
    TargetModules, TokenEmbeddings, VocabularyExtension,
};

fn model() -> Model {
    let vb = VarBuilder::from_tensors(backbone_weights(), DType::F32, &Device::Cpu);
    Model::new(&phi3_config(), vb).unwrap()
}

fn param(model: &mut Model, name: &str) -> Tensor {
    let mut found = None;
    model
        .visit_params_mut(&mut |n, t| {
            if n == name {
                found = Some(t.clone());
            }
            Ok(())
        })
        .unwrap();
    found.unwrap()
}

fn logits(model: &mut Model, ids: &[u32]) -> Vec<f32> {
    model.clear_kv_cache();
    let ids = Tensor::new(ids, &Device::Cpu).unwrap().unsqueeze(0).unwrap();
    let embeds = model.embed(&ids).unwrap();
    model
        .forward_embeds(&embeds, 0)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()
}

#[test]
fn switching_adapters_reproduces_outputs_exactly() {
    let mut m = model();
    let cfg = HLoraConfig {
        rank: 4,
        alpha: 8.0,
        dropout: 0.0,
        nums: 3,
    };
    let selector = AdapterSelector::new(cfg.nums).unwrap();
    let adapted = m
        .attach_adapters(&TargetModules::all_linear(), &cfg, &selector)
        .unwrap();
    assert_eq!(adapted, 8);

    // give every adapter its own trained-looking B
    m.visit_params_mut(&mut |name, t| {
        if name.contains(".lora_B.") {
            *t = t.randn_like(0., 0.05)?;
        }
        Ok(())
    })
    .unwrap();

    let ids = [5u32, 8, 9, 10, 11];
    selector.select(0).unwrap();
    let y0 = logits(&mut m, &ids);
    selector.select(2).unwrap();
    let y2 = logits(&mut m, &ids);
    selector.select(0).unwrap();
    let y0_again = logits(&mut m, &ids);

    assert_ne!(y0, y2);
    assert_eq!(y0, y0_again);
}

#[test]
fn lm_head_and_embeddings_are_never_adapted() {
    let mut m = model();
    let cfg = HLoraConfig {
        rank: 2,
        alpha: 4.0,
        dropout: 0.0,
        nums: 2,
    };
    let selector = AdapterSelector::new(2).unwrap();
    m.attach_adapters(&TargetModules::all_linear(), &cfg, &selector)
        .unwrap();
    let mut names = Vec::new();
    m.visit_params_mut(&mut |n, _| {
        names.push(n.to_string());
        Ok(())
    })
    .unwrap();
    assert!(names.iter().any(|n| n == "model.layers.1.mlp.down_proj.lora_B.1.weight"));
    assert!(!names.iter().any(|n| n.starts_with("lm_head.lora")));
    assert!(!names.iter().any(|n| n.starts_with("model.embed_tokens.lora")));
}

#[test]
fn vocabulary_extension_is_idempotent_and_keeps_rows() {
    let mut m = model();
    let mut tokenizer = WordTokenizer::new();
    let before = param(&mut m, "model.embed_tokens.weight")
        .to_vec2::<f32>()
        .unwrap();
    let head_before = param(&mut m, "lm_head.weight").to_vec2::<f32>().unwrap();

    let first = VocabularyExtension::extend(&mut tokenizer, &mut m, 16).unwrap();
    assert_eq!(first.added, 3 + 16);
    assert_eq!(m.embedding_rows(), BASE_VOCAB + 19);
    assert_eq!(first.image_token_id as usize, BASE_VOCAB);
    assert_eq!(first.vq_index_ids.len(), 16);
    assert_eq!(first.vq_index_of(first.vq_index_ids[7]), Some(7));

    let second = VocabularyExtension::extend(&mut tokenizer, &mut m, 16).unwrap();
    assert_eq!(second.added, 0);
    assert_eq!(second.image_token_id, first.image_token_id);
    assert_eq!(second.vq_index_ids, first.vq_index_ids);
    assert_eq!(m.embedding_rows(), BASE_VOCAB + 19);

    let after = param(&mut m, "model.embed_tokens.weight")
        .to_vec2::<f32>()
        .unwrap();
    let head_after = param(&mut m, "lm_head.weight").to_vec2::<f32>().unwrap();
    assert_eq!(&after[..BASE_VOCAB], before.as_slice());
    assert_eq!(&head_after[..BASE_VOCAB], head_before.as_slice());

    // new rows are the mean of the original ones
    let mean0: f32 = before.iter().map(|r| r[0]).sum::<f32>() / BASE_VOCAB as f32;
    assert!((after[BASE_VOCAB][0] - mean0).abs() < 1e-6);
}
