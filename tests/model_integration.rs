//! End-to-end exercise of the three execution modes on one small corpus.

use apuntar::{BatchedInput, Mode, Model, ModelConfig, TokenId, Vocabulary};

fn vocab() -> Vocabulary {
    Vocabulary::new(
        [
            "<unk>", "<s>", "</s>", "the", "cat", "sat", "on", "a", "mat", "dog",
        ],
        "<unk>",
        "<s>",
        "</s>",
    )
    .unwrap()
}

fn batch(vocab: &Vocabulary) -> BatchedInput {
    let v = vocab.size() as TokenId;
    let sources = vec![
        vocab.encode(&["the", "cat", "sat", "on", "a", "mat"]),
        vocab.encode(&["a", "dog", "sat"]),
    ];
    // The first example copies source positions 1 and 5.
    let targets = vec![
        vec![
            vocab.lookup("the"),
            v + 1,
            vocab.lookup("sat"),
            v + 5,
        ],
        vocab.encode(&["the", "dog"]),
    ];
    let flags = vec![vec![false, true, false, true], vec![false, false]];
    BatchedInput::new(&sources, &targets, &flags, vocab.sos_id(), vocab.eos_id()).unwrap()
}

#[test]
fn train_eval_infer_round() {
    let v = vocab();
    let data = batch(&v);

    let mut trainer = Model::new(ModelConfig::tiny(), Mode::Train, v.clone(), v.clone()).unwrap();
    let mut last_weight = 0.0;
    for step in 0..3 {
        let out = trainer.train_step(&data).unwrap();
        assert!(out.loss.is_finite() && out.loss > 0.0, "step {step}");
        assert!(out.kl_weight >= last_weight);
        last_weight = out.kl_weight;
        trainer.advance_global_step();
    }
    assert_eq!(trainer.global_step(), 3);

    let mut evaluator = Model::new(ModelConfig::tiny(), Mode::Eval, v.clone(), v.clone()).unwrap();
    let eval = evaluator.eval_step(&data).unwrap();
    assert!(eval.loss.is_finite());
    assert_eq!(eval.batch_size, 2);

    let mut decoder = Model::new(ModelConfig::tiny(), Mode::Infer, v.clone(), v.clone()).unwrap();
    let out = decoder.infer(&data).unwrap();
    assert_eq!(out.sample_ids.dim().0, 1);
    assert_eq!(out.sample_ids.dim().1, 2);
    // Every rendered token resolves to a real string.
    for words in &out.sample_words[0] {
        for word in words {
            assert!(!word.is_empty());
        }
    }
}

#[test]
fn beam_respects_explicit_iteration_cap() {
    let v = vocab();
    let data = batch(&v);
    let mut config = ModelConfig::tiny().with_beam_width(2);
    config.tgt_max_len_infer = Some(5);

    let mut model = Model::new(config, Mode::Infer, v.clone(), v).unwrap();
    let out = model.infer(&data).unwrap();
    let (beams, batch_size, steps) = out.sample_ids.dim();
    assert_eq!(beams, 2);
    assert_eq!(batch_size, 2);
    assert!(steps <= 5);
    assert_eq!(out.top_sample_ids().dim(), (2, steps));
}

#[test]
fn partial_batch_is_accepted() {
    // tiny() is configured for batch_size 4; feed it 2 examples.
    let v = vocab();
    let data = batch(&v);
    assert_eq!(data.batch_size(), 2);

    let mut trainer = Model::new(ModelConfig::tiny(), Mode::Train, v.clone(), v).unwrap();
    let out = trainer.train_step(&data).unwrap();
    assert_eq!(out.batch_size, 2);
}
